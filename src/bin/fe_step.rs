use std::path::PathBuf;

use northstar_fe::{
    init_logging, log_app_start, logging_config_from_env, run_step, runtime_config_from_env,
    Collaborators, CsvDirectorySource, LocalArtifactStore, PriceSource, RuntimeConfig,
    SqliteTrackingStore,
};

const USAGE: &str = "usage: fe_step <execution-id> [--catalog assets.json] [--template template.json]";

struct Args {
    exec_id: String,
    catalog: Option<PathBuf>,
    template: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("fe_step", &logging_cfg);

    let args = parse_args(std::env::args().skip(1))?;
    let runtime = runtime_config_from_env();
    let store = SqliteTrackingStore::open(&runtime.store_path)?;

    if let Some(path) = &args.catalog {
        let imported = store.import_catalog_json(&std::fs::read_to_string(path)?)?;
        println!("imported {imported} assets from {}", path.display());
    }
    if let Some(path) = &args.template {
        // The template is registered under the execution id.
        store.put_template(&args.exec_id, &std::fs::read_to_string(path)?)?;
        store.create_execution(&args.exec_id, &args.exec_id)?;
    }

    let artifacts = LocalArtifactStore::new(runtime.artifact_root.clone());
    let prices = price_source(&runtime, &store)?;
    let collaborators = Collaborators {
        catalog: &store,
        prices: prices.as_ref(),
        templates: &store,
        status: &store,
        importance: &store,
        artifacts: &artifacts,
    };

    let summary = run_step(&args.exec_id, &collaborators, &runtime)?;
    println!(
        "execution {} finished: {} rows x {} columns, {} train / {} test records, fingerprint {}",
        summary.exec_id,
        summary.rows,
        summary.columns.len(),
        summary.train_records,
        summary.test_records,
        summary.fingerprint
    );
    if !summary.missing_tickers.is_empty() {
        println!("missing tickers: {}", summary.missing_tickers.join(", "));
    }
    Ok(())
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args, Box<dyn std::error::Error>> {
    let exec_id = raw.next().ok_or(USAGE)?;
    let mut args = Args {
        exec_id,
        catalog: None,
        template: None,
    };
    while let Some(flag) = raw.next() {
        let value = raw.next().ok_or(USAGE)?;
        match flag.as_str() {
            "--catalog" => args.catalog = Some(PathBuf::from(value)),
            "--template" => args.template = Some(PathBuf::from(value)),
            _ => return Err(format!("unknown argument {flag}; {USAGE}").into()),
        }
    }
    Ok(args)
}

#[cfg(feature = "asset-sync")]
fn price_source(
    runtime: &RuntimeConfig,
    store: &SqliteTrackingStore,
) -> Result<Box<dyn PriceSource>, Box<dyn std::error::Error>> {
    use northstar_fe::{AssetCatalog, AssetSyncConfig, RemoteCsvSource};

    match &runtime.assets_base_url {
        Some(base_url) => {
            let cfg = AssetSyncConfig::new(base_url.clone(), runtime.assets_dir.clone());
            Ok(Box::new(RemoteCsvSource::new(cfg, store.assets()?)?))
        }
        None => Ok(Box::new(CsvDirectorySource::new(runtime.assets_dir.clone()))),
    }
}

#[cfg(not(feature = "asset-sync"))]
fn price_source(
    runtime: &RuntimeConfig,
    _store: &SqliteTrackingStore,
) -> Result<Box<dyn PriceSource>, Box<dyn std::error::Error>> {
    Ok(Box::new(CsvDirectorySource::new(runtime.assets_dir.clone())))
}
