//! hopstore command line tool
//!
//! Initializes embedded databases, dumps stored nodes as JSON and lists
//! the type mappings of an application directory.

use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};
use hopstore::core::types::format_date;
use hopstore::storage::Dialect;
use hopstore::{Config, NodeRef, Store, Value};
use serde_json::{json, Map};
use tracing::info;

fn main() -> anyhow::Result<()> {
    let matches = Command::new("hopstore")
        .version(hopstore::VERSION)
        .about("Object-relational node store.")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("db-home")
                .long("db-home")
                .value_name("DIR")
                .global(true)
                .help("Embedded database directory"),
        )
        .arg(
            Arg::new("app-dir")
                .long("app-dir")
                .value_name("DIR")
                .global(true)
                .help("Application directory with type.properties files"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .subcommand(Command::new("init").about("Create the database home and root nodes"))
        .subcommand(
            Command::new("get")
                .about("Print a stored node as JSON")
                .arg(Arg::new("id").required(true).value_name("ID")),
        )
        .subcommand(
            Command::new("mappings")
                .about("List the type mappings and their SQL fragments")
                .arg(
                    Arg::new("dialect")
                        .long("dialect")
                        .value_name("DIALECT")
                        .default_value("standard")
                        .help("SQL dialect (standard, oracle)"),
                ),
        )
        .get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    apply_cli_overrides(&mut config, &matches);
    config.validate()?;
    hopstore::init_logging(&config.logging)?;

    let store = Store::open(config).context("Failed to open store")?;

    match matches.subcommand() {
        Some(("init", _)) => {
            let db = store.node_manager().database();
            info!(home = %db.home().display(), "Database ready");
            println!(
                "{} (next id {})",
                db.home().display(),
                db.id_generator().value() + 1
            );
        }
        Some(("get", sub)) => {
            let id = sub
                .get_one::<String>("id")
                .context("Missing node id")?;
            let key = store.registry().embedded_key(id);
            let Some(node) = store.wrapped().get_node(&key)? else {
                bail!("Node {} not found", id);
            };
            println!("{}", serde_json::to_string_pretty(&node_json(&node))?);
        }
        Some(("mappings", sub)) => {
            let name = sub.get_one::<String>("dialect").map_or("standard", String::as_str);
            let Some(dialect) = Dialect::from_name(name) else {
                bail!("Unknown dialect {}", name);
            };
            let registry = store.registry();
            for name in registry.names() {
                let Some(mapping) = registry.get(&name) else { continue };
                println!(
                    "{} (storage {}, extends {})",
                    name,
                    mapping.storage_type_name(),
                    mapping.extends().unwrap_or_else(|| "-".into()),
                );
                if !mapping.is_relational() {
                    println!("  embedded");
                    continue;
                }
                println!(
                    "  source {} table {}",
                    mapping.db_source_name().unwrap_or_default(),
                    mapping.table_name().unwrap_or_default(),
                );
                let select = mapping
                    .select(dialect, None)
                    .with_context(|| format!("Can't render select of {}", name))?;
                println!("  {}", select.with_conditions(&[]));
                println!("  {}...", mapping.update_prefix()?);
            }
        }
        _ => bail!("Unknown command"),
    }

    store.shutdown()?;
    Ok(())
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &ArgMatches) {
    if let Some(home) = matches.get_one::<String>("db-home") {
        config.storage.db_home = home.into();
    }

    if let Some(dir) = matches.get_one::<String>("app-dir") {
        config.mapping.app_dir = Some(dir.into());
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
}

fn node_json(node: &NodeRef) -> serde_json::Value {
    let n = node.read();
    let mut properties = Map::new();
    for prop in n.properties() {
        let value = match prop.value() {
            Value::String(s) => json!(s),
            Value::Integer(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::Boolean(b) => json!(b),
            Value::Date(d) => json!(format_date(d)),
            Value::Node(h) => json!({ "idref": h.id() }),
        };
        properties.insert(prop.name().to_string(), value);
    }
    let children: Vec<String> = n.subnodes().loaded_handles().iter().map(|h| h.id()).collect();

    json!({
        "id": n.id(),
        "name": n.name(),
        "prototype": n.prototype(),
        "created": format_date(&n.created()),
        "lastModified": format_date(&n.last_modified()),
        "parent": n.parent().map(|h| h.id()),
        "properties": properties,
        "children": children,
    })
}
