use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use matim::{
    active_connection::ActiveNode,
    client::WriteItem,
    codec::Value,
    config::{self, NodeConfig},
    datamodel::InMemoryDataModel,
    messages::{ReadRequest, SubscribeRequest},
    node::{Node, NodeEvent},
    report::{AttributePathFilter, ConcreteAttributePath, ConcreteCommandPath},
    schema::SchemaTree,
    session::Session,
    transport,
};

const DEFAULT_LOCAL_ADDRESS: &str = "0.0.0.0:5540";
const DEFAULT_SCHEMA: &str = "demos/onoff_light.json";
const CLUSTER_ON_OFF: u32 = 6;
const CLUSTER_LEVEL_CONTROL: u32 = 8;

#[derive(Parser, Debug)]
#[command()]
struct Cli {
    #[clap(long)]
    #[arg(global = true, default_value_t = false)]
    verbose: bool,

    #[clap(long)]
    #[arg(global = true, default_value_t = DEFAULT_SCHEMA.to_string())]
    schema: String,

    /// Node configuration json; defaults are used when missing
    #[clap(long)]
    #[arg(global = true)]
    config: Option<String>,

    #[clap(long)]
    #[arg(global = true, default_value_t = DEFAULT_LOCAL_ADDRESS.to_string())]
    local_address: String,

    #[clap(long)]
    #[arg(global = true, default_value_t = 1)]
    session: u16,

    #[clap(long)]
    #[arg(global = true, default_value_t = 2)]
    peer_session: u16,

    /// Hex encoded 16 byte session key; messages are plaintext without it
    #[clap(long)]
    #[arg(global = true)]
    key: Option<String>,

    peer_address: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the schema from memory until interrupted
    Serve,
    Read {
        endpoint: Option<u16>,
        cluster: Option<u32>,
        attribute: Option<u32>,
    },
    Subscribe {
        endpoint: u16,
        cluster: u32,
        attribute: u32,
        #[clap(long)]
        #[arg(default_value_t = 1)]
        min: u16,
        #[clap(long)]
        #[arg(default_value_t = 30)]
        max: u16,
    },
    /// Write json value
    Write {
        endpoint: u16,
        cluster: u32,
        attribute: u32,
        value: String,
        #[clap(long)]
        version: Option<u32>,
        #[clap(long)]
        timed: Option<u16>,
    },
    /// Invoke command with json payload
    Invoke {
        endpoint: u16,
        cluster: u32,
        command: u32,
        #[arg(default_value_t = String::from("{}"))]
        payload: String,
        #[clap(long)]
        timed: Option<u16>,
    },
}

fn light_model() -> InMemoryDataModel {
    let on_off = ConcreteAttributePath::new(1, CLUSTER_ON_OFF, 0);
    let level = ConcreteAttributePath::new(1, CLUSTER_LEVEL_CONTROL, 0);
    let mut dm = InMemoryDataModel::new();
    dm.insert(on_off, Value::Bool(false), 1);
    dm.insert(ConcreteAttributePath::new(1, CLUSTER_ON_OFF, 0x4000), Value::Bool(true), 1);
    dm.insert(ConcreteAttributePath::new(1, CLUSTER_ON_OFF, 0x4001), Value::UInt(0), 1);
    dm.insert(level, Value::UInt(254), 1);
    dm.insert(ConcreteAttributePath::new(1, CLUSTER_LEVEL_CONTROL, 0x11), Value::Null, 1);
    dm.on_command(ConcreteCommandPath::new(1, CLUSTER_ON_OFF, 0), move |_, store| {
        store.set(on_off, Value::Bool(false));
        Ok(None)
    });
    dm.on_command(ConcreteCommandPath::new(1, CLUSTER_ON_OFF, 1), move |_, store| {
        store.set(on_off, Value::Bool(true));
        Ok(None)
    });
    dm.on_command(ConcreteCommandPath::new(1, CLUSTER_ON_OFF, 2), move |_, store| {
        let current = store.get(&on_off).and_then(|(v, _)| v.as_bool()).unwrap_or(false);
        store.set(on_off, Value::Bool(!current));
        Ok(None)
    });
    dm.on_command(ConcreteCommandPath::new(1, CLUSTER_LEVEL_CONTROL, 0), move |payload, store| {
        let value = payload.get("level").cloned().unwrap_or(Value::Null);
        store.set(level, value);
        Ok(None)
    });
    dm
}

fn session(cli: &Cli) -> Result<Session> {
    let mut session = Session::new(cli.session, cli.peer_session);
    if let Some(key) = &cli.key {
        let key = hex::decode(key).context("session key is not hex")?;
        session.set_encrypt_key(&key)?;
        session.set_decrypt_key(&key)?;
    }
    Ok(session)
}

fn print_reports(reports: &[matim::report::Report]) {
    for r in reports {
        println!("{}", r);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let schema = Arc::new(SchemaTree::load(&cli.schema)?);
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => NodeConfig::default(),
    };
    let mut node = Node::new(config, schema, light_model());
    node.add_session(session(&cli)?);
    let transport = transport::Transport::new(&cli.local_address).await?;
    let connection = transport.create_connection(&cli.peer_address).await;
    let active = ActiveNode::new(node, HashMap::from([(cli.session, connection)]));

    match cli.command {
        Commands::Serve => {
            println!("serving on {}", transport.local_addr()?);
            loop {
                tokio::select! {
                    event = active.recv_event() => match event {
                        Some(NodeEvent::SubscriptionTerminated { subscription_id, reason }) => {
                            println!("subscription {} terminated: {:?}", subscription_id, reason)
                        }
                        Some(other) => println!("{:?}", other),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::Read {
            endpoint,
            cluster,
            attribute,
        } => {
            let filter = AttributePathFilter {
                endpoint_id: endpoint,
                cluster_id: cluster,
                attribute_id: attribute,
                ..AttributePathFilter::wildcard()
            };
            let request = ReadRequest {
                attribute_paths: vec![filter],
                ..Default::default()
            };
            print_reports(&active.read(cli.session, request).await?);
        }
        Commands::Subscribe {
            endpoint,
            cluster,
            attribute,
            min,
            max,
        } => {
            let request = SubscribeRequest {
                keep_subscriptions: false,
                min_interval_floor: min,
                max_interval_ceiling: max,
                attribute_paths: vec![AttributePathFilter::concrete(endpoint, cluster, attribute)],
                event_paths: vec![],
                event_min: None,
                fabric_filtered: false,
            };
            let (mut subscription, priming) = active.subscribe(cli.session, request).await?;
            println!(
                "subscription {} established, max interval {}s",
                subscription.subscription_id, subscription.max_interval
            );
            print_reports(&priming);
            loop {
                tokio::select! {
                    report = subscription.next_report() => print_reports(&report?),
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::Write {
            endpoint,
            cluster,
            attribute,
            value,
            version,
            timed,
        } => {
            let json: serde_json::Value = serde_json::from_str(&value).context("value is not json")?;
            let mut item = WriteItem::new(ConcreteAttributePath::new(endpoint, cluster, attribute), Value::from(json));
            if let Some(v) = version {
                item = item.expect_version(v);
            }
            for status in active.write(cli.session, vec![item], false, timed).await? {
                println!("{} {}", status.path, status.status);
            }
        }
        Commands::Invoke {
            endpoint,
            cluster,
            command,
            payload,
            timed,
        } => {
            let json: serde_json::Value = serde_json::from_str(&payload).context("payload is not json")?;
            let path = ConcreteCommandPath::new(endpoint, cluster, command);
            for result in active.invoke(cli.session, path, Value::from(json), timed).await? {
                match result.response {
                    Some(response) => println!("{:?}", response),
                    None => println!("{}", result.status),
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = {
        if cli.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Error
        }
    };
    env_logger::Builder::new()
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_line_number(true)
        .format_file(true)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli))
}
