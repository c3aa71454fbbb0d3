//! CLI walkthrough: seeds the in-memory stores, scores both demo sectors,
//! runs the risk batch, and prints what landed.

use crate::infra::{build_services, seed_demo_data, Stores, DEMO_PERIOD, DEMO_SECTORS};
use aquascore::config::CalibrationConfig;
use aquascore::error::AppError;
use aquascore::scoring::canonical::Period;
use aquascore::scoring::risk::RiskRunRequest;
use aquascore::scoring::service::ScoringError;
use clap::Args;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Period to score, YYYY-MM (defaults to the seeded demo period)
    #[arg(long)]
    pub(crate) periodo: Option<String>,
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let periodo = args.periodo.unwrap_or_else(|| DEMO_PERIOD.to_string());
    let period = Period::parse(&periodo)
        .ok_or_else(|| AppError::from(ScoringError::InvalidPeriod(periodo.clone())))?;

    let stores = Stores::default();
    seed_demo_data(&stores);
    let (scoring, risk, _params, _groups) = build_services(&stores, CalibrationConfig::default());

    println!("== potential scoring ==");
    for sector in DEMO_SECTORS {
        let report = scoring.run(period, sector).await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&report).expect("report serializes")
        );
    }

    println!("== risk batch ==");
    let request = RiskRunRequest {
        escopo: "setor".to_string(),
        identificadores: DEMO_SECTORS.iter().map(|s| s.to_string()).collect(),
        periodo: period.month_key(),
        janela_meses: 12,
        reprocess: false,
    };
    let report = risk.run(&request)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("report serializes")
    );

    println!(
        "stored: {} score rows, {} risk rows",
        stores.scores.len(),
        stores.risks.len()
    );
    Ok(())
}
