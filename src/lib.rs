//! Matter interaction model engine
//!
//! This library implements the interaction layer of a Matter node: reads, writes, command invocation
//! and subscriptions, carried over reliable exchanges on top of established sessions.
//! Following are main parts of api:
//! - [Node](node::Node) - sans-io node. Serves reads, writes, invokes and subscriptions from a
//!                        [DataModel](datamodel::DataModel) and issues the same requests to peers.
//!                        Fed with datagrams and a clock, emits datagrams and [NodeEvent](node::NodeEvent)s.
//! - [ActiveNode](active_connection::ActiveNode) - runs a node on a tokio task over
//!                        [Transport](transport::Transport) connections and exposes async request methods.
//! - [SchemaTree](schema::SchemaTree) - endpoints, clusters, attributes, events and commands of a node,
//!                        loadable from json. Drives typed encoding in [codec].
//! - [tlv] - Matter TLV encoder and decoder.
//! - [config] - reliability, payload and subscription limits, stored as json.
//!
//! Example reading attributes of endpoint 1 from a peer reachable over an existing session:
//! ```no_run
//! # use anyhow::Result;
//! # use std::{collections::HashMap, sync::Arc};
//! # use matim::{active_connection::ActiveNode, config::NodeConfig, datamodel::InMemoryDataModel};
//! # use matim::{messages::ReadRequest, node::Node, report::AttributePathFilter, schema::SchemaTree};
//! # use matim::{session::Session, transport::Transport};
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let schema = Arc::new(SchemaTree::load("schema.json")?);
//! let mut node = Node::new(NodeConfig::default(), schema, InMemoryDataModel::new());
//! node.add_session(Session::new(1, 2));
//! let transport = Transport::new("0.0.0.0:5555").await?;
//! let connection = transport.create_connection("192.168.1.20:5540").await;
//! let active = ActiveNode::new(node, HashMap::from([(1, connection)]));
//! let request = ReadRequest {
//!     attribute_paths: vec![AttributePathFilter::wildcard().endpoint(1)],
//!     ..Default::default()
//! };
//! for report in active.read(1, request).await? {
//!     println!("{}", report);
//! }
//! # Ok(())
//! # }
//! ```

pub mod active_connection;
pub mod client;
pub mod codec;
pub mod config;
pub mod datamodel;
pub mod error;
mod exchange;
mod interaction;
pub mod messages;
pub mod node;
pub mod report;
mod retransmit;
pub mod schema;
pub mod session;
pub mod status;
mod subscription;
pub mod tlv;
pub mod transport;
mod util;

pub use error::{DecodeError, EncodeError, ImError, ImResult};
pub use exchange::{CloseReason, ExchangeKey, Outgoing, Role};
pub use status::StatusCode;
pub use subscription::{SubscriptionState, TerminationReason};
