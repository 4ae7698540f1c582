//! End-to-end persistence: bootstrap from the page store, debounced
//! flush back into it, and the storage-origin tie-break.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use papyrus_core::{room_name, BlockKind, TableGrid};
use papyrus_collab::adapter::ClientSyncAdapter;
use papyrus_collab::client::{SyncClient, SyncEvent};
use papyrus_collab::server::{ServerConfig, SyncServer};
use papyrus_collab::store::{MemoryPageStore, PagePatch, PageStore};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_test_server(store: Arc<dyn PageStore>) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        room_grace: Duration::from_secs(60),
        presence_timeout: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(5),
    };
    let server = Arc::new(SyncServer::new(config).with_store(store));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// Connect a fresh client and apply its initial snapshot.
async fn join_synced(
    url: &str,
    doc_id: &str,
    name: &str,
) -> (
    ClientSyncAdapter,
    SyncClient,
    tokio::sync::mpsc::Receiver<SyncEvent>,
) {
    let adapter = ClientSyncAdapter::new(doc_id, Some(name));
    let mut client = SyncClient::new(adapter.peer_id(), room_name(doc_id), url);
    let mut events = client.take_event_rx().unwrap();
    client.connect(None).await.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Some(SyncEvent::Synced { payload, .. })) => {
                adapter.apply_sync(&payload).unwrap();
                break;
            }
            Ok(Some(_)) => continue,
            _ => continue,
        }
    }
    (adapter, client, events)
}

#[tokio::test]
async fn test_room_bootstraps_from_stored_page() {
    let store = Arc::new(MemoryPageStore::new());
    let page = store.create("My Notes").unwrap();
    store
        .update(
            &page.id,
            PagePatch::blocks(vec![
                papyrus_core::Block::new("b1", BlockKind::Text, "first", 0),
                papyrus_core::Block::new(
                    "b2",
                    BlockKind::Table,
                    r#"{"rows":[["a","b"],["c","d"]]}"#,
                    1,
                ),
            ]),
        )
        .unwrap();

    let port = start_test_server(store.clone()).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, _client, _events) = join_synced(&url, &page.id, "Alice").await;
    let blocks = alice.ordered_blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].content, "first");

    // Table payloads survive the trip bit for bit.
    let grid = TableGrid::parse(&blocks[1].content).unwrap();
    assert_eq!(grid.rows, vec![
        vec!["a".to_string(), "b".to_string()],
        vec!["c".to_string(), "d".to_string()],
    ]);
}

#[tokio::test]
async fn test_edits_flush_back_to_store() {
    let store = Arc::new(MemoryPageStore::new());
    let page = store.create("Draft").unwrap();
    let block_id = page.blocks[0].id.clone();

    let port = start_test_server(store.clone()).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, client, _events) = join_synced(&url, &page.id, "Alice").await;
    let edit = alice.edit_block_content(&block_id, "written through").unwrap();
    client.send_update(edit).await.unwrap();

    // Flushes are debounced; poll the store until the write lands.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut persisted = None;
    while std::time::Instant::now() < deadline {
        let stored = store.get(&page.id).unwrap();
        if stored.blocks.iter().any(|b| b.content == "written through") {
            persisted = Some(stored);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let persisted = persisted.expect("edit should be flushed to the store");
    assert_eq!(persisted.blocks.len(), 1);
    assert_eq!(persisted.title, "Draft");
}

#[tokio::test]
async fn test_flush_replaces_deleted_blocks() {
    let store = Arc::new(MemoryPageStore::new());
    let page = store.create("Draft").unwrap();
    let block_id = page.blocks[0].id.clone();

    let port = start_test_server(store.clone()).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, client, _events) = join_synced(&url, &page.id, "Alice").await;
    let (kept, updates) = alice
        .insert_block_after(Some(&block_id), BlockKind::Code)
        .unwrap();
    for u in updates {
        client.send_update(u).await.unwrap();
    }
    client
        .send_update(alice.edit_block_content(&kept, "let x = 1;").unwrap())
        .await
        .unwrap();
    client
        .send_update(alice.delete_block(&block_id).unwrap())
        .await
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stored = store.get(&page.id).unwrap();
        if stored.blocks.len() == 1 && stored.blocks[0].id == kept {
            assert_eq!(stored.blocks[0].content, "let x = 1;");
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "store should converge to the surviving block, got {:?}",
            stored.blocks
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_offline_edit_outranks_stored_seed() {
    // Alice loads the page over REST, edits before the socket is up,
    // then connects. Her edit must win over the storage seed.
    let store = Arc::new(MemoryPageStore::new());
    let page = store.create("Draft").unwrap();
    let block_id = page.blocks[0].id.clone();

    let port = start_test_server(store.clone()).await;
    let url = format!("ws://127.0.0.1:{port}");

    let alice = ClientSyncAdapter::new(&page.id, Some("Alice"));
    alice.bootstrap_from_page(&page.blocks).unwrap();
    let client = SyncClient::new(alice.peer_id(), room_name(&page.id), &url);
    client
        .send_update(alice.edit_block_content(&block_id, "offline edit").unwrap())
        .await
        .unwrap();

    client.connect(Some(&alice.state_vector())).await.unwrap();

    // A second client's view reflects Alice's edit, not the seed.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (bob, _c, _e) = join_synced(&url, &page.id, "Bob").await;
        if bob
            .get_block(&block_id)
            .is_some_and(|b| b.content == "offline edit")
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "offline edit should supersede the stored seed"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_burst_of_edits_coalesces_flushes() {
    let store = Arc::new(MemoryPageStore::new());
    let page = store.create("Draft").unwrap();
    let block_id = page.blocks[0].id.clone();

    let port = start_test_server(store.clone()).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, client, _events) = join_synced(&url, &page.id, "Alice").await;
    for i in 0..20 {
        let edit = alice
            .edit_block_content(&block_id, &format!("revision {i}"))
            .unwrap();
        client.send_update(edit).await.unwrap();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stored = store.get(&page.id).unwrap();
        if stored.blocks[0].content == "revision 19" {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "final revision should be flushed"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
