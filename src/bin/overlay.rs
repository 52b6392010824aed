use clap::{Parser, Subcommand};
use gpkg_overlay::{
    AccessMode, Gpkg, Ident, LookupConfig, LookupTable, PipelineConfig, Store, classify_labels,
    dissolve_by_label, export_table_to_csv, export_table_to_gpkg, load_gpkg_layer, pipeline,
    reclassify_layer, with_connection,
};
use rusqlite::types::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use wkt::to_wkt::write_geometry;

#[derive(Parser)]
#[command(name = "overlay", version, about = "Polygon overlap and area statistics for GeoPackage layers")]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the whole overlap pipeline from a TOML config
    Run { config: PathBuf },
    /// Load one GeoPackage layer into a store
    Load {
        database: PathBuf,
        gpkg: PathBuf,
        layer: String,
        /// Do not read or write the parquet/ cache
        #[arg(long)]
        no_staging: bool,
    },
    /// List the tables of a store or the layers of a GeoPackage
    Info {
        path: PathBuf,
        /// Print every feature of every GeoPackage layer
        #[arg(long)]
        features: bool,
    },
    /// Export a store table to GeoPackage and/or CSV
    Export {
        database: PathBuf,
        table: Ident,
        #[arg(long)]
        gpkg: Option<PathBuf>,
        /// Layer name in the GeoPackage (default: the table name)
        #[arg(long)]
        layer: Option<String>,
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Geometry column written to the GeoPackage layer
        #[arg(long, default_value = "geom")]
        geom_field: Ident,
    },
    /// Reclassify a GeoPackage layer field through a CSV lookup
    Reclassify {
        gpkg: PathBuf,
        layer: String,
        /// TOML file with a [lookup] table
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Key columns, comma separated
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,
        #[arg(long)]
        value: Option<String>,
        /// CSV header rename, as SOURCE=KEY; repeatable
        #[arg(long, value_parser = parse_rename)]
        rename: Vec<(String, String)>,
    },
    /// Label a numeric field with percent classes
    Labels {
        database: PathBuf,
        table: Ident,
        value_field: Ident,
        #[arg(long, default_value = "label")]
        label_field: Ident,
        /// Class breaks, comma separated, e.g. -0.01,5,10,15,20,30,50,70,100
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
        breaks: Vec<f64>,
        /// Also dissolve the geometries by label into this table
        #[arg(long)]
        dissolve: Option<Ident>,
        #[arg(long, default_value = "geom")]
        geom_field: Ident,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = run(cli.command) {
        eprintln!("overlay failed: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Run { config } => {
            let config = PipelineConfig::from_path(config)?;
            let report = pipeline::run(&config)?;
            for (reference, summary) in &report.summaries {
                println!(
                    "{reference}: {} rows, {} unique ids",
                    summary.rows, summary.unique_ids
                );
                for row in &summary.worst_differences {
                    println!(
                        "  id={} sum={} area={} diff={}",
                        format_value(&row.id),
                        format_number(row.sum),
                        format_number(row.area),
                        format_number(row.difference)
                    );
                }
            }
            for failure in &report.load_failures {
                println!(
                    "not loaded: {} from {}: {}",
                    failure.layer,
                    failure.gpkg.display(),
                    failure.error
                );
            }
            for failure in &report.failures {
                println!("failed: {}.{}: {}", failure.table, failure.field, failure.error);
            }
            if !report.is_complete() {
                return Err(format!(
                    "{} layer(s) not loaded, {} field(s) failed",
                    report.load_failures.len(),
                    report.failures.len()
                )
                .into());
            }
        }
        Command::Load {
            database,
            gpkg,
            layer,
            no_staging,
        } => {
            let outcome = with_connection(&database, AccessMode::ReadWrite, |store| {
                load_gpkg_layer(store, &gpkg, &layer, !no_staging)
            })?;
            println!("{layer}: {outcome:?}");
        }
        Command::Info { path, features } => {
            if is_gpkg(&path) {
                print_gpkg(&path, features)?;
            } else {
                print_store(&path)?;
            }
        }
        Command::Export {
            database,
            table,
            gpkg,
            layer,
            csv,
            geom_field,
        } => {
            if gpkg.is_none() && csv.is_none() {
                return Err("nothing to export, pass --gpkg and/or --csv".into());
            }
            with_connection(&database, AccessMode::ReadOnly, |store| {
                if let Some(path) = &gpkg {
                    let layer = layer.as_deref().unwrap_or(table.as_str());
                    export_table_to_gpkg(store, &table, &geom_field, path, layer)?;
                }
                if let Some(path) = &csv {
                    export_table_to_csv(store, &table, path)?;
                }
                Ok(())
            })?;
        }
        Command::Reclassify {
            gpkg,
            layer,
            config,
            csv,
            keys,
            value,
            rename,
        } => {
            let mut lookup = match config {
                Some(path) => LookupConfig::from_path(path)?,
                None => LookupConfig {
                    csv: csv.clone().ok_or("--csv or --config is required")?,
                    keys: keys.clone(),
                    value: value.clone().ok_or("--value or --config is required")?,
                    rename: HashMap::new(),
                },
            };
            if let Some(csv) = csv {
                lookup.csv = csv;
            }
            if !keys.is_empty() {
                lookup.keys = keys;
            }
            if let Some(value) = value {
                lookup.value = value;
            }
            lookup.rename.extend(rename);

            let table =
                LookupTable::from_csv(&lookup.csv, &lookup.keys, &lookup.value, &lookup.rename)?;
            let report = reclassify_layer(&gpkg, &layer, &table)?;
            println!(
                "{layer}: {} features, {} matched, {} missed",
                report.features, report.matched, report.missed
            );
        }
        Command::Labels {
            database,
            table,
            value_field,
            label_field,
            breaks,
            dissolve,
            geom_field,
        } => {
            with_connection(&database, AccessMode::ReadWrite, |store| {
                let outcome = classify_labels(store, &table, &value_field, &label_field, &breaks)?;
                println!("{table}: {} rows labelled", outcome.rows());
                if let Some(output) = &dissolve {
                    let outcome =
                        dissolve_by_label(store, &table, &label_field, &geom_field, output)?;
                    println!("{output}: {} label groups", outcome.rows());
                }
                Ok(())
            })?;
        }
    }
    Ok(())
}

fn parse_rename(s: &str) -> Result<(String, String), String> {
    let (source, key) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SOURCE=KEY, got {s:?}"))?;
    Ok((source.trim().to_string(), key.trim().to_string()))
}

fn is_gpkg(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gpkg"))
}

fn print_store(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(path, AccessMode::ReadOnly)?;
    for table in store.list_tables()? {
        let ident = Ident::new(table.as_str())?;
        let rows: i64 = store.connection().query_row(
            &format!("SELECT COUNT(*) FROM {}", ident.quoted()),
            [],
            |row| row.get(0),
        )?;
        println!("table: {table} ({rows} rows)");
        for spec in store.column_specs(&ident)? {
            println!("  {}: {:?}", spec.name, spec.column_type);
        }
    }
    store.close()?;
    Ok(())
}

fn print_gpkg(path: &Path, features: bool) -> Result<(), Box<dyn std::error::Error>> {
    let gpkg = Gpkg::open_read_only(path)?;
    for layer_name in gpkg.list_layers()? {
        let layer = gpkg.open_layer(&layer_name)?;
        println!(
            "layer: {layer_name} ({} features, srs {})",
            layer.count()?,
            layer.srs_id
        );
        for column in &layer.property_columns {
            println!("  {}: {:?}", column.name, column.column_type);
        }
        if !features {
            continue;
        }

        for feature in layer.features()? {
            let mut values = Vec::with_capacity(layer.property_columns.len() + 1);
            let wkt = match feature.geometry() {
                Ok(wkb) => {
                    let mut wkt = String::new();
                    write_geometry(&mut wkt, &wkb)?;
                    wkt
                }
                Err(_) => "NULL".to_string(),
            };
            values.push(format!("{}={wkt}", layer.geometry_column));
            for (column, value) in layer.property_columns.iter().zip(feature.properties()) {
                values.push(format!("{}={}", column.name, format_value(value)));
            }
            println!("  fid {}: {}", feature.id(), values.join(", "));
        }
    }
    Ok(())
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(value) => value.to_string(),
        Value::Real(value) => value.to_string(),
        Value::Text(value) => value.clone(),
        Value::Blob(value) => format!("<{} bytes>", value.len()),
    }
}

fn format_number(value: Option<f64>) -> String {
    value.map_or_else(|| "NULL".to_string(), |v| format!("{v:.2}"))
}
