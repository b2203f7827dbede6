use super::{DevnetKeys, ScenarioArgs};
use clap::Parser;
use eyre::Result;

#[derive(Parser, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    format: String,
}

impl PlanArgs {
    pub async fn run(self) -> Result<()> {
        let config = self.scenario.load_config()?;
        let keys = DevnetKeys::new(&config);
        let plan = self.scenario.build_plan(&config, &keys)?;

        let expected = plan.expected_deltas(&config.fees, &config.bridged_assets)?;
        let funding =
            plan.required_funding(&config.fees, config.scenario.funding_headroom_percent);

        if self.format == "json" {
            let funding: Vec<_> = funding
                .iter()
                .map(|(account, amounts)| {
                    serde_json::json!({
                        "account": account,
                        "amounts": amounts
                            .iter()
                            .map(|(denom, amount)| (denom.as_str(), amount.to_string()))
                            .collect::<std::collections::BTreeMap<_, _>>(),
                    })
                })
                .collect();
            let data = serde_json::json!({
                "transfers": plan.total_transfers(),
                "expected": expected,
                "funding": funding,
            });
            println!("{}", serde_json::to_string_pretty(&data)?);
            return Ok(());
        }

        println!("Transfer Plan");
        println!("=============");
        println!();
        println!("Kind:              {:?}", plan.kind());
        println!("Amount per tx:     {}{}", plan.amount_per_tx(), plan.denom());
        println!("Total transfers:   {}", plan.total_transfers());
        println!();

        println!("Expected Balance Changes:");
        println!("  {:<12} {:<46} {:<8} {:>24}", "SIDE", "ACCOUNT", "DENOM", "DELTA");
        for delta in &expected {
            println!(
                "  {:<12} {:<46} {:<8} {:>24}",
                delta.side.to_string(),
                delta.account.as_str(),
                delta.denom.as_str(),
                delta.delta
            );
        }
        println!();

        println!("Required Funding:");
        for (account, amounts) in &funding {
            let amounts: Vec<_> = amounts
                .iter()
                .map(|(denom, amount)| format!("{amount}{denom}"))
                .collect();
            println!("  {account}: {}", amounts.join(", "));
        }

        Ok(())
    }
}
