use std::{
    error::Error,
    fs::File,
    io::{self, BufRead, BufReader},
    sync::Arc,
};

use batchbank::{
    app::Application,
    backend::{open_store, Connectors},
    config::{CliArgs, Config, LoggingConfig},
    crypto::KeyPair,
    keys::KeyRegistry,
    processor::BatchProcessor,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use prettytable::{row, Table};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn input_lines(path: &std::path::Path) -> Result<Box<dyn BufRead>, io::Error> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    Ok(Box::new(BufReader::new(File::open(path)?)))
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = CliArgs::parse();

    if cli.generate_key {
        let keys = KeyPair::generate();
        println!("public_key = \"{}\"", keys.public_key_hex());
        println!("secret_key = \"{}\"", keys.secret_key_hex());
        return Ok(());
    }

    let config = Config::load(&cli)?;
    init_logging(&config.logging);

    let metrics = if cli.metrics {
        Some(PrometheusBuilder::new().install_recorder()?)
    } else {
        None
    };

    let store = open_store(&config.storage, &Connectors::default())?;
    store.initialize()?;
    tracing::info!(
        backend = store.name(),
        guarantee = ?store.commit_guarantee(),
        policy = %config.processor.policy,
        "batchbank starting"
    );

    let processor = BatchProcessor::new(store.clone(), Arc::new(KeyRegistry::new())).with_policy(config.processor.policy);
    let app = Application::new(processor);
    app.init_chain(&config.genesis)?;

    let mut results = Table::new();
    results.add_row(row!["#", "Code", "Result"]);
    if let Some(path) = &cli.input {
        for (line_no, line) in input_lines(path)?.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let result = app.deliver_tx(line.as_bytes());
            results.add_row(row![line_no + 1, result.code, result.log]);
        }
        results.printstd();
    }

    let mut balances = Table::new();
    balances.add_row(row!["Account", "Balance"]);
    for account in app.query_state()? {
        balances.add_row(row![account.id, account.balance]);
    }
    balances.printstd();

    store.close()?;

    if let Some(handle) = metrics {
        println!("{}", handle.render());
    }
    Ok(())
}
