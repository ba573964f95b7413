use anyhow::Result;
use placscraper::{pipeline, Config};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,placscraper=info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");

    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {:?}", info);
    }));

    // ─── 2) load configuration ───────────────────────────────────────
    let cfg = match std::env::args().nth(1) {
        Some(path) => {
            info!(%path, "loading config");
            Config::load(&path)?
        }
        None => Config::default(),
    };

    // ─── 3) run the pipeline ─────────────────────────────────────────
    let summary = pipeline::run(&cfg).await?;
    for report in &summary.periods {
        match &report.error {
            Some(reason) => info!(period = %report.period, %reason, "period failed"),
            None => info!(
                period = %report.period,
                records = report.records,
                documents = report.documents,
                "period done"
            ),
        }
    }
    info!(
        records = summary.records_after_dedup,
        deduped = summary.records_before_dedup - summary.records_after_dedup,
        outputs = ?summary.outputs,
        "all done"
    );
    Ok(())
}
