//! Integration tests for the login -> world -> channel flow
//!
//! These tests wire all three tiers in one process (as standalone mode does)
//! and drive them with framed clients over in-memory streams:
//! - login, character creation and handoff to a channel
//! - migration token redemption, including replay
//! - group chat with events relayed back through the channel
//! - the TCP RPC transport between world and channel

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use realmgate_server::config::ServerConfig;
use realmgate_server::error::{LoginResponse, MigrationResponse, RpcError, RpcStatus};
use realmgate_server::game::persistence::{MemoryStorage, Storage};
use realmgate_server::net::buffer::{PacketReader, PacketWriter};
use realmgate_server::net::handler::ConnectionHandler;
use realmgate_server::net::transport::{framed_client, FramedStream};
use realmgate_server::protocol::login::CLIENT_VERSION;
use realmgate_server::protocol::opcodes::{RecvOp, SendOp};
use realmgate_server::rpc::{
    serve_tcp, AnnouncePresenceRequest, ChannelTransport, HeartbeatRequest, RpcGateway,
    RpcPolicies, TcpTransport, TransferSessionRequest, TransferTarget,
};
use realmgate_server::service::{LocalConnector, TcpConnector};
use realmgate_server::state::{ChannelNode, LoginNode, WorldNode};

type Client = FramedStream<DuplexStream>;

const LOCAL_CHANNEL: &str = "local:channel";

struct Cluster {
    world: WorldNode,
    login: LoginNode,
    channel: ChannelNode,
}

async fn cluster() -> Cluster {
    let config = ServerConfig {
        dev_mode: true,
        ..ServerConfig::default()
    };
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let connector = Arc::new(LocalConnector::new(64));

    let world = WorldNode::new(&config, connector.clone()).unwrap();
    let login = LoginNode::new(
        &config,
        storage.clone(),
        Arc::new(ChannelTransport::pair(world.service.clone(), 64)),
    )
    .unwrap();
    let channel = ChannelNode::new(
        &config,
        storage,
        Arc::new(ChannelTransport::pair(world.service.clone(), 64)),
    )
    .unwrap();

    connector.register(LOCAL_CHANNEL, channel.service.clone());
    let known = channel
        .announce(LOCAL_CHANNEL, config.public_addr(config.channel_port()).unwrap())
        .await
        .unwrap();
    assert_eq!(known, vec![1]);

    Cluster {
        world,
        login,
        channel,
    }
}

fn connect(handler: ConnectionHandler, port: u16) -> Client {
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let addr = format!("127.0.0.1:{}", port).parse().unwrap();
        let _ = handler.handle_stream(server, addr).await;
    });
    framed_client(client)
}

async fn send(client: &mut Client, opcode: RecvOp, build: impl FnOnce(&mut PacketWriter)) {
    let mut packet = PacketWriter::new(opcode.as_u16());
    build(&mut packet);
    client.send(packet.freeze()).await.unwrap();
}

/// Next packet, which must carry `opcode`; the reader is positioned after it
async fn expect(client: &mut Client, opcode: SendOp) -> PacketReader {
    let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a packet")
        .expect("stream ended")
        .unwrap();
    let mut reader = PacketReader::new(frame.freeze());
    assert_eq!(reader.read_u16().unwrap(), opcode.as_u16());
    reader
}

async fn expect_closed(client: &mut Client) {
    let next = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("connection stayed open");
    assert!(next.is_none());
}

async fn hello(client: &mut Client, machine_id: Uuid) {
    send(client, RecvOp::ResponseVersion, |w| {
        w.write_u32(CLIENT_VERSION).write_bytes(machine_id.as_bytes());
    })
    .await;
}

struct Grant {
    account_id: i64,
    token: u64,
    channel: u16,
    port: u16,
}

/// Log in, create a character and select it
async fn login_and_select(cluster: &Cluster, username: &str, machine_id: Uuid) -> Grant {
    let mut client = connect(cluster.login.connection_handler(), 4000);
    hello(&mut client, machine_id).await;

    send(&mut client, RecvOp::ResponseLogin, |w| {
        w.write_u8(2)
            .write_unicode_string(username)
            .write_unicode_string("secret");
    })
    .await;
    let mut result = expect(&mut client, SendOp::LoginResult).await;
    assert_eq!(result.read_u8().unwrap(), LoginResponse::Success.as_u8());
    let account_id = result.read_i64().unwrap();

    let mut list = expect(&mut client, SendOp::CharacterList).await;
    assert_eq!(list.read_u8().unwrap(), 0);
    list.skip(1).unwrap();
    assert_eq!(list.read_u8().unwrap(), 0);

    send(&mut client, RecvOp::CharacterManagement, |w| {
        w.write_u8(1).write_unicode_string(username);
    })
    .await;
    let mut added = expect(&mut client, SendOp::CharacterList).await;
    assert_eq!(added.read_u8().unwrap(), 1);
    let character_id = added.read_i64().unwrap();
    assert_eq!(added.read_unicode_string().unwrap(), username);

    send(&mut client, RecvOp::CharacterManagement, |w| {
        w.write_u8(0).write_i64(character_id);
    })
    .await;
    let mut migrate = expect(&mut client, SendOp::LoginToGame).await;
    assert_eq!(migrate.read_u8().unwrap(), MigrationResponse::Ok.as_u8());
    assert_eq!(migrate.read_u8().unwrap(), 4);
    assert_eq!(&migrate.read_bytes(4).unwrap()[..], &[127, 0, 0, 1]);
    let port = migrate.read_u16().unwrap();
    let token = migrate.read_u64().unwrap();
    let channel = migrate.read_u16().unwrap();

    // The login server lets go once the handoff is issued
    expect_closed(&mut client).await;

    Grant {
        account_id,
        token,
        channel,
        port,
    }
}

async fn enter_game(cluster: &Cluster, grant: &Grant, machine_id: Uuid) -> Client {
    let mut client = connect(cluster.channel.connection_handler(), 5000);
    hello(&mut client, machine_id).await;
    send(&mut client, RecvOp::ResponseKey, |w| {
        w.write_i64(grant.account_id).write_u64(grant.token);
    })
    .await;
    let mut moved = expect(&mut client, SendOp::MoveResult).await;
    assert_eq!(moved.read_u8().unwrap(), MigrationResponse::Ok.as_u8());
    client
}

#[tokio::test]
async fn test_login_handoff_and_heartbeat() {
    let cluster = cluster().await;
    let machine = Uuid::new_v4();

    let grant = login_and_select(&cluster, "Alice", machine).await;
    assert_eq!(grant.channel, 1);
    assert_eq!(grant.port, 20002);
    assert_eq!(cluster.world.service.pending_tokens(), 1);

    let mut game = enter_game(&cluster, &grant, machine).await;
    assert_eq!(cluster.world.service.pending_tokens(), 0);
    assert_eq!(cluster.channel.entities.len(), 1);

    send(&mut game, RecvOp::ResponseHeartbeat, |w| {
        w.write_u32(0xC0FFEE);
    })
    .await;
    let mut beat = expect(&mut game, SendOp::RequestHeartbeat).await;
    assert_eq!(beat.read_u32().unwrap(), 0xC0FFEE);

    // Leaving play removes the entity again
    drop(game);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cluster.channel.entities.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_token_replay_is_refused() {
    let cluster = cluster().await;
    let machine = Uuid::new_v4();
    let grant = login_and_select(&cluster, "Alice", machine).await;
    let _game = enter_game(&cluster, &grant, machine).await;

    let mut replay = connect(cluster.channel.connection_handler(), 5001);
    hello(&mut replay, machine).await;
    send(&mut replay, RecvOp::ResponseKey, |w| {
        w.write_i64(grant.account_id).write_u64(grant.token);
    })
    .await;
    let mut refused = expect(&mut replay, SendOp::MoveResult).await;
    assert_eq!(
        refused.read_u8().unwrap(),
        MigrationResponse::InvalidToken.as_u8()
    );
    expect_closed(&mut replay).await;
}

#[tokio::test]
async fn test_token_bound_to_machine() {
    let cluster = cluster().await;
    let grant = login_and_select(&cluster, "Alice", Uuid::new_v4()).await;

    let mut thief = connect(cluster.channel.connection_handler(), 5002);
    hello(&mut thief, Uuid::new_v4()).await;
    send(&mut thief, RecvOp::ResponseKey, |w| {
        w.write_i64(grant.account_id).write_u64(grant.token);
    })
    .await;
    let mut refused = expect(&mut thief, SendOp::MoveResult).await;
    assert_eq!(
        refused.read_u8().unwrap(),
        MigrationResponse::InvalidToken.as_u8()
    );
    // A failed claim leaves the token for its rightful owner
    assert_eq!(cluster.world.service.pending_tokens(), 1);
}

#[tokio::test]
async fn test_group_chat_across_sessions() {
    let cluster = cluster().await;
    let alice_machine = Uuid::new_v4();
    let bob_machine = Uuid::new_v4();

    let alice_grant = login_and_select(&cluster, "Alice", alice_machine).await;
    let mut alice = enter_game(&cluster, &alice_grant, alice_machine).await;
    let bob_grant = login_and_select(&cluster, "Bob", bob_machine).await;
    let mut bob = enter_game(&cluster, &bob_grant, bob_machine).await;

    // Create: the creator hears about it through the relay
    send(&mut alice, RecvOp::GroupChat, |w| {
        w.write_u8(1);
    })
    .await;
    let mut created = expect(&mut alice, SendOp::GroupChat).await;
    assert_eq!(created.read_u8().unwrap(), 1);
    let group_id = created.read_i32().unwrap();

    // Join: the joiner gets the roster, everyone else an add-member
    send(&mut bob, RecvOp::GroupChat, |w| {
        w.write_u8(2).write_i32(group_id);
    })
    .await;
    let mut roster = expect(&mut bob, SendOp::GroupChat).await;
    assert_eq!(roster.read_u8().unwrap(), 3);
    assert_eq!(roster.read_i32().unwrap(), group_id);
    assert_eq!(roster.read_u8().unwrap(), 2);

    let mut added = expect(&mut alice, SendOp::GroupChat).await;
    assert_eq!(added.read_u8().unwrap(), 6);
    assert_eq!(added.read_i32().unwrap(), group_id);
    assert_eq!(added.read_unicode_string().unwrap(), "Bob");

    // Chat reaches every member, the sender included
    send(&mut alice, RecvOp::GroupChat, |w| {
        w.write_u8(10)
            .write_unicode_string("hello group")
            .write_i32(group_id);
    })
    .await;
    for client in [&mut alice, &mut bob] {
        let mut line = expect(client, SendOp::GroupChat).await;
        assert_eq!(line.read_u8().unwrap(), 10);
        assert_eq!(line.read_i32().unwrap(), group_id);
        assert_eq!(line.read_unicode_string().unwrap(), "Alice");
        assert_eq!(line.read_unicode_string().unwrap(), "hello group");
    }

    // Bob disconnecting takes him out of the group
    drop(bob);
    let mut removed = expect(&mut alice, SendOp::GroupChat).await;
    assert_eq!(removed.read_u8().unwrap(), 7);
    assert_eq!(removed.read_i32().unwrap(), group_id);
    assert_eq!(removed.read_unicode_string().unwrap(), "Bob");

    let members = cluster.world.groups().members(group_id as u64).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].name, "Alice");
}

#[tokio::test]
async fn test_group_chat_refusal_keeps_session() {
    let cluster = cluster().await;
    let machine = Uuid::new_v4();
    let grant = login_and_select(&cluster, "Alice", machine).await;
    let mut alice = enter_game(&cluster, &grant, machine).await;

    send(&mut alice, RecvOp::GroupChat, |w| {
        w.write_u8(2).write_i32(12345);
    })
    .await;
    let mut error = expect(&mut alice, SendOp::GroupChat).await;
    assert_eq!(error.read_u8().unwrap(), 13);

    // Still in play
    send(&mut alice, RecvOp::ResponseHeartbeat, |w| {
        w.write_u32(7);
    })
    .await;
    let mut beat = expect(&mut alice, SendOp::RequestHeartbeat).await;
    assert_eq!(beat.read_u32().unwrap(), 7);
}

#[tokio::test]
async fn test_world_rpc_over_tcp() {
    let config = ServerConfig::default();
    let world = WorldNode::new(&config, Arc::new(TcpConnector::new(1024 * 1024))).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_tcp(
        listener,
        world.service.clone(),
        shutdown.clone(),
        1024 * 1024,
    ));

    let gateway = RpcGateway::new(
        "world",
        Arc::new(TcpTransport::new(address, 1024 * 1024)),
        RpcPolicies::default(),
    );

    let beat = gateway.call(HeartbeatRequest { sequence: 9 }).await.unwrap();
    assert_eq!(beat.sequence, 9);
    assert_eq!(beat.server, "Realmgate");

    let transfer = TransferSessionRequest {
        account_id: 1,
        character_id: 2,
        machine_id: Uuid::nil(),
        target: TransferTarget::Channel(None),
    };
    match gateway.call(transfer.clone()).await {
        Err(RpcError::Remote(fault)) => assert_eq!(fault.code, RpcStatus::Unavailable),
        other => panic!("expected a remote fault, got {:?}", other),
    }

    gateway
        .call(AnnouncePresenceRequest {
            channel: 4,
            rpc_address: "127.0.0.1:1".into(),
            client_address: "127.0.0.1:20005".parse().unwrap(),
        })
        .await
        .unwrap();
    let granted = gateway.call(transfer).await.unwrap();
    assert_eq!(granted.channel, 4);
    assert_eq!(granted.address, "127.0.0.1:20005".parse().unwrap());

    shutdown.cancel();
    server.await.unwrap();
}
