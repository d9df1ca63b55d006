//! revenue-runner: headless runner for the revenue pipeline.
//!
//! Usage:
//!   revenue-runner --demo --seed 12345 --customers 80 --months 18 --db run.db
//!   revenue-runner --demo --spike-month 10 --spike-factor 0.8
//!   revenue-runner --records records.json --tenant acme --config pipeline.json
//!   revenue-runner --ipc-mode
//!
//! `--records` takes a JSON array of normalized records, or one record per
//! line when the file ends in `.jsonl`.

use anyhow::{bail, Context, Result};
use revenue_core::{
    config::PipelineConfig,
    engine::{CancellationToken, PipelineReport, RevenuePipeline},
    invocation,
    record::NormalizedRecord,
    store::MetricStore,
    synthetic::{self, Spike, SyntheticConfig},
};
use std::env;
use std::io::{self, BufRead, Write};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let customers = parse_arg(&args, "--customers", 60usize);
    let months = parse_arg(&args, "--months", 12usize);
    let spike_month: Option<usize> = flag_value(&args, "--spike-month").and_then(|v| v.parse().ok());
    let spike_factor = parse_arg(&args, "--spike-factor", 0.5f64);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let demo = args.iter().any(|a| a == "--demo");
    let records_path = flag_value(&args, "--records");
    let tenant = flag_value(&args, "--tenant").unwrap_or("demo");
    let db = flag_value(&args, "--db").unwrap_or(":memory:");

    let config = match flag_value(&args, "--config") {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    let mut pipeline = RevenuePipeline::new(&config)?;

    if ipc_mode {
        return run_ipc_loop(&mut pipeline);
    }

    let (records, seed_used) = match (records_path, demo) {
        (Some(path), _) => (load_records(path)?, None),
        (None, true) => {
            let synthetic_config = SyntheticConfig {
                seed,
                customers,
                months,
                spike: spike_month.map(|month| Spike { month, factor: spike_factor }),
                ..Default::default()
            };
            (synthetic::generate(synthetic_config), Some(seed))
        }
        (None, false) => bail!("nothing to run: pass --records FILE, --demo or --ipc-mode"),
    };

    println!("Revenue pipeline: revenue-runner");
    println!("  tenant:    {tenant}");
    println!("  records:   {}", records.len());
    match seed_used {
        Some(seed) => println!("  source:    synthetic (seed {seed})"),
        None => println!("  source:    {}", records_path.unwrap_or_default()),
    }
    println!("  db:        {db}");
    println!();

    let store = MetricStore::open(db)?;
    store.migrate()?;
    let history = store.load_history(tenant, pipeline.ontology())?;
    let seeded = pipeline.seed_history(&history);
    if seeded > 0 {
        println!("  history:   {seeded} stored metric values");
        println!();
    }

    let run_id = format!("run-{}-{}", seed_used.unwrap_or(0), chrono::Utc::now().timestamp());
    let report = pipeline.run(&run_id, tenant, &records, &CancellationToken::new())?;
    store.save_report(&report, seed_used, env!("CARGO_PKG_VERSION"))?;

    print_summary(&report);
    Ok(())
}

fn run_ipc_loop(pipeline: &mut RevenuePipeline) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        let line = buffer.trim();
        if line.is_empty() {
            continue;
        }
        writeln!(stdout, "{}", invocation::handle_line(pipeline, line))?;
        stdout.flush()?;
    }
    Ok(())
}

fn load_records(path: &str) -> Result<Vec<NormalizedRecord>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Cannot read {path}"))?;
    if path.ends_with(".jsonl") {
        content
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| {
                serde_json::from_str(l).with_context(|| format!("{path}:{}: bad record", i + 1))
            })
            .collect()
    } else {
        serde_json::from_str(&content).with_context(|| format!("{path}: expected a JSON array of records"))
    }
}

fn print_summary(report: &PipelineReport) {
    println!("=== RUN SUMMARY ===");
    println!("  run_id:         {}", report.run_id);
    println!("  periods:        {}", report.snapshots.len());
    println!("  entities:       {}", report.entity_count());
    println!("  metric values:  {}", report.metric_values.len());
    println!("  anomalies:      {}", report.anomalies.len());

    println!();
    println!("=== MONTHLY REVENUE ===");
    for snapshot in &report.snapshots {
        let p = snapshot.period;
        let get = |id: &str| report.value(id, p).map(|v| v.value).unwrap_or(0.0);
        let warned = report
            .metric_values
            .iter()
            .any(|v| v.period == p && v.has_warnings());
        println!(
            "  {p} | MRR: ${:>10.2} | New: ${:>9.2} | Churned: ${:>9.2} | NRR: {:>6.1}% | Customers: {:>4}{}",
            get("mrr"),
            get("new_mrr"),
            get("churned_mrr"),
            get("nrr"),
            get("active_customers"),
            if warned { " (!)" } else { "" }
        );
    }

    println!();
    println!("=== ANOMALIES (by severity) ===");
    if report.anomalies.is_empty() {
        println!("  (none)");
        return;
    }
    let mut ranked: Vec<_> = report.anomalies.iter().collect();
    ranked.sort_by(|a, b| b.severity.total_cmp(&a.severity));
    for a in ranked.iter().take(10) {
        let metric = match &a.component_of {
            Some(parent) => format!("{} (in {parent})", a.metric_id),
            None => a.metric_id.clone(),
        };
        println!(
            "  {} | {:<28} | {:?} {:?} | observed {:.2} vs {:.2} | severity {:.2}",
            a.period, metric, a.method, a.direction, a.observed_value, a.baseline, a.severity
        );
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    flag_value(args, flag)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
