use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use matim::{
    active_connection::ActiveNode,
    client::WriteItem,
    codec::Value,
    config::NodeConfig,
    datamodel::InMemoryDataModel,
    messages::{ReadRequest, ReportData, SubscribeRequest},
    node::Node,
    report::{AttributePathFilter, AttributeValue, ConcreteAttributePath, ConcreteCommandPath, Report},
    schema::SchemaTree,
    session::Session,
    transport::Transport,
    StatusCode,
};

const SCHEMA: &str = include_str!("../demos/onoff_light.json");

fn on_off() -> ConcreteAttributePath {
    ConcreteAttributePath::new(1, 6, 0)
}

fn light() -> InMemoryDataModel {
    let mut dm = InMemoryDataModel::new();
    dm.insert(on_off(), Value::Bool(false), 1);
    dm.insert(ConcreteAttributePath::new(1, 6, 0x4000), Value::Bool(true), 1);
    dm.insert(ConcreteAttributePath::new(1, 6, 0x4001), Value::UInt(0), 1);
    dm.insert(ConcreteAttributePath::new(1, 8, 0), Value::UInt(254), 1);
    dm.insert(ConcreteAttributePath::new(1, 8, 0x11), Value::Null, 1);
    dm.on_command(ConcreteCommandPath::new(1, 6, 1), |_, store| {
        store.set(on_off(), Value::Bool(true));
        Ok(None)
    });
    dm
}

async fn pair(config: NodeConfig) -> Result<(ActiveNode<InMemoryDataModel>, ActiveNode<InMemoryDataModel>)> {
    let schema = Arc::new(SchemaTree::from_json(SCHEMA)?);
    let server_transport = Transport::new("127.0.0.1:0").await?;
    let client_transport = Transport::new("127.0.0.1:0").await?;
    let server_address = server_transport.local_addr()?.to_string();
    let client_address = client_transport.local_addr()?.to_string();

    let key = hex::decode("00112233445566778899aabbccddeeff")?;
    let mut server_session = Session::new(2, 1);
    server_session.set_encrypt_key(&key)?;
    server_session.set_decrypt_key(&key)?;
    let mut client_session = Session::new(1, 2);
    client_session.set_encrypt_key(&key)?;
    client_session.set_decrypt_key(&key)?;

    let mut server = Node::new(config.clone(), schema.clone(), light());
    server.add_session(server_session);
    let mut client = Node::new(config, schema, InMemoryDataModel::new());
    client.add_session(client_session);

    let server_conn = server_transport.create_connection(&client_address).await;
    let client_conn = client_transport.create_connection(&server_address).await;
    Ok((
        ActiveNode::new(server, HashMap::from([(2, server_conn)])),
        ActiveNode::new(client, HashMap::from([(1, client_conn)])),
    ))
}

#[tokio::test]
async fn read_invoke_subscribe_write() -> Result<()> {
    let (server, client) = pair(NodeConfig::default()).await?;

    let request = ReadRequest {
        attribute_paths: vec![AttributePathFilter::concrete(1, 6, 0)],
        ..Default::default()
    };
    let reports = client.read(1, request).await?;
    assert_eq!(
        reports,
        vec![Report::AttributeValue(AttributeValue {
            path: on_off(),
            version: 1,
            value: Value::Bool(false)
        })]
    );

    let request = SubscribeRequest {
        keep_subscriptions: false,
        min_interval_floor: 0,
        max_interval_ceiling: 10,
        attribute_paths: vec![AttributePathFilter::concrete(1, 6, 0)],
        event_paths: vec![],
        event_min: None,
        fabric_filtered: false,
    };
    let (mut subscription, priming) = client.subscribe(1, request).await?;
    assert_eq!(priming.len(), 1);
    assert_eq!(subscription.max_interval, 10);

    let empty = Value::object(Vec::<(String, Value)>::new());
    let results = client.invoke(1, ConcreteCommandPath::new(1, 6, 1), empty, None).await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, StatusCode::Success);

    let report = tokio::time::timeout(Duration::from_secs(5), subscription.next_report()).await??;
    assert_eq!(
        report,
        vec![Report::AttributeValue(AttributeValue {
            path: on_off(),
            version: 2,
            value: Value::Bool(true)
        })]
    );

    let on_time = ConcreteAttributePath::new(1, 6, 0x4001);
    let statuses = client
        .write(1, vec![WriteItem::new(on_time, Value::UInt(30)).expect_version(1)], false, None)
        .await?;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, StatusCode::Success);
    let stored = server.with_data(move |dm| dm.attribute(&on_time).cloned()).await?;
    assert_eq!(stored, Some((Value::UInt(30), 2)));

    // read only attribute
    let statuses = client
        .write(1, vec![WriteItem::new(on_off(), Value::Bool(false))], false, None)
        .await?;
    assert_eq!(statuses[0].status, StatusCode::UnsupportedWrite);
    Ok(())
}

#[tokio::test]
async fn chunked_read_over_udp() -> Result<()> {
    let config = NodeConfig {
        max_payload_size: ReportData::envelope_len(false) + 30,
        ..NodeConfig::default()
    };
    let (_server, client) = pair(config).await?;
    let request = ReadRequest {
        attribute_paths: vec![AttributePathFilter::wildcard().endpoint(1)],
        ..Default::default()
    };
    let mut read = client.read_chunked(1, request).await?;
    let mut chunks = 0;
    let mut paths = Vec::new();
    while let Some(chunk) = read.next_chunk().await? {
        chunks += 1;
        paths.extend(chunk.iter().filter_map(|r| r.attribute_path().copied()));
    }
    assert!(chunks > 1);
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
    assert_eq!(paths.len(), 5);
    Ok(())
}
