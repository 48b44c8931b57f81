use clap::{Parser, Subcommand, ValueEnum};
use plexdb::schema::{parse_schema, SCHEMA_FILE};
use plexdb::{Collection, Database, Document, Fields, Schema, SchemaDefinition};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

/// PlexDB CLI: inspect and edit a PlexDB database from the command line
#[derive(Parser)]
#[command(name = "plexdb", version, about)]
struct Cli {
    /// Path to the database root (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap a new database
    Init {
        /// Directory to create the database in
        path: PathBuf,
        /// Database name (default: the directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Get a single document by ID
    Get {
        /// Collection name
        collection: String,
        /// Document ID
        id: String,
    },

    /// Find documents by field equality
    Find {
        /// Collection name
        collection: String,
        /// Field values to match (e.g. --field username=alice)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Return every match instead of the first one
        #[arg(long)]
        all: bool,
    },

    /// Create and write a new document
    Insert {
        /// Collection name
        collection: String,
        /// Field values (e.g. --field username=alice)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a document
    Delete {
        /// Collection name
        collection: String,
        /// Document ID
        id: String,
    },

    /// List every document in a collection
    List {
        /// Collection name
        collection: String,
    },

    /// Show the values recorded in a field index
    Index {
        /// Collection name
        collection: String,
        /// Indexed field
        field: String,
    },

    /// Rebuild index entries from the stored documents
    Reindex {
        /// Only rebuild a specific collection
        #[arg(long)]
        collection: Option<String>,
    },

    /// Show collection stats and cache residency
    Status,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s.find('=').ok_or_else(|| {
        format!("Invalid key=value pair: no '=' found in '{s}'")
    })?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    if let Command::Init { path, name } = &cli.command {
        let name = match name {
            Some(name) => name.clone(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "plexdb".to_string()),
        };
        Database::create_new(path, &name).await?;
        return print_output(
            &serde_json::json!({ "ok": true, "name": name, "path": path.display().to_string() }),
            &cli.format,
        );
    }

    let db = Database::open(&cli.data_dir).await?;
    let schemas = load_schemas(&cli.data_dir)?;
    let result = execute(&db, &schemas, cli.command).await;
    db.close().await?;
    print_output(&result?, &cli.format)
}

async fn execute(
    db: &Database,
    schemas: &SchemaDefinition,
    command: Command,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let output = match command {
        Command::Init { .. } => return Err("init cannot run against an open database".into()),

        Command::Get { collection, id } => {
            let collection = open_collection(db, schemas, &collection).await?;
            let doc = collection
                .get(&id)
                .await?
                .ok_or_else(|| format!("Document not found: {}/{id}", collection.name()))?;
            serde_json::to_value(&doc)?
        }

        Command::Find {
            collection,
            fields,
            all,
        } => {
            let collection = open_collection(db, schemas, &collection).await?;
            let query = fields_to_map(&fields)?;
            if all {
                serde_json::to_value(collection.find_all(&query).await?)?
            } else {
                serde_json::to_value(collection.find_one(&query).await?)?
            }
        }

        Command::Insert { collection, fields } => {
            let collection = open_collection(db, schemas, &collection).await?;
            let doc = collection.create(&fields_to_map(&fields)?).await?;
            collection.write(&doc).await?;
            serde_json::to_value(&doc)?
        }

        Command::Delete { collection, id } => {
            let collection = open_collection(db, schemas, &collection).await?;
            let existed = collection.get(&id).await?.is_some();
            collection
                .delete(&Document::new(id.clone(), Fields::new()))
                .await?;
            serde_json::json!({ "ok": true, "deleted": id, "existed": existed })
        }

        Command::List { collection } => {
            let collection = open_collection(db, schemas, &collection).await?;
            let docs = collection
                .query_all(|doc| async move { doc }, Some(Duration::ZERO))
                .await?;
            serde_json::to_value(docs)?
        }

        Command::Index { collection, field } => {
            let collection = open_collection(db, schemas, &collection).await?;
            serde_json::to_value(collection.index_values(&field).await?)?
        }

        Command::Reindex { collection } => {
            let names = match collection {
                Some(name) => vec![name],
                None => known_collections(db, schemas),
            };
            let mut rebuilt = serde_json::Map::new();
            for name in names {
                let collection = open_collection(db, schemas, &name).await?;
                rebuilt.insert(name, collection.reindex().await?.into());
            }
            serde_json::json!({ "ok": true, "reindexed": rebuilt })
        }

        Command::Status => db.status().await?,
    };
    Ok(output)
}

/// Collections from the metadata followed by any only declared in schema.yaml
fn known_collections(db: &Database, schemas: &SchemaDefinition) -> Vec<String> {
    let mut names = db.collections();
    for name in schemas.collections.keys() {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}

fn load_schemas(data_dir: &Path) -> Result<SchemaDefinition, Box<dyn std::error::Error>> {
    let path = data_dir.join(SCHEMA_FILE);
    if path.is_file() {
        Ok(parse_schema(&path)?)
    } else {
        log::debug!("No {SCHEMA_FILE} in {}, using id-only schemas", data_dir.display());
        Ok(SchemaDefinition::default())
    }
}

async fn open_collection(
    db: &Database,
    schemas: &SchemaDefinition,
    name: &str,
) -> Result<Collection, Box<dyn std::error::Error>> {
    let schema = match schemas.collections.get(name) {
        Some(definition) => definition.to_schema()?,
        None => Schema::new(),
    };
    Ok(db.collection(name, schema).await?)
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value)?);
        }
    }
    Ok(())
}

fn fields_to_map(fields: &[(String, String)]) -> Result<Fields, Box<dyn std::error::Error>> {
    let mut map = Fields::new();
    for (key, val) in fields {
        // Try to parse as JSON value (for numbers, booleans, arrays, objects)
        let json_val = serde_json::from_str(val).unwrap_or(serde_json::Value::String(val.clone()));
        map.insert(key.clone(), serde_yaml::to_value(json_val)?);
    }
    Ok(map)
}
