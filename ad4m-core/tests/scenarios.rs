//! End-to-end behaviour of the engine through its facade.

use ad4m_core::language::{interfaces, RemoteLinksCallback};
use ad4m_core::{
    actions, domains, Ad4mCore, AdapterError, Address, AddressScheme, AddressSpace, CapabilityRequest, ChangeEvent,
    ContentLanguage, CoreConfig, CoreError, Expression, ExpressionSigner, Language, Link, LinkInput, LinkQuery,
    LinkSyncAdapter, Node, PerspectiveDiff, Resource, Topic, NEIGHBOURHOOD_LANGUAGE_ID,
};
use std::collections::HashMap;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

const ADMIN: &str = "admin-secret";

async fn engine_with(config: CoreConfig) -> Ad4mCore {
    let core = Ad4mCore::open(CoreConfig {
        admin_credential: Some(ADMIN.into()),
        jwt_secret: Some("scenario-secret".into()),
        ..config
    })
    .await
    .unwrap();
    core.initialize_agent(ADMIN, "passphrase", None).await.unwrap();
    core
}

async fn engine() -> Ad4mCore {
    engine_with(CoreConfig::ephemeral()).await
}

fn node(s: &str) -> Node {
    Node::parse(s).unwrap()
}

fn abc() -> LinkInput {
    LinkInput::new(node("a://1"), node("b://2"), node("c://3"))
}

#[tokio::test]
async fn test_add_query_remove_roundtrip() {
    let core = engine().await;
    let p = core.create_perspective(ADMIN, "P").await.unwrap().uuid;

    let link = core.add_link(ADMIN, p, abc()).await.unwrap();
    let by_source = core
        .query_links(ADMIN, p, &LinkQuery::all().source(node("a://1")))
        .unwrap();
    assert_eq!(by_source, vec![link.clone()]);

    assert!(core.remove_link(ADMIN, p, &link).await.unwrap());
    assert!(core.query_links(ADMIN, p, &LinkQuery::all()).unwrap().is_empty());
}

#[tokio::test]
async fn test_token_scoped_to_one_perspective() {
    let core = engine().await;
    let p = core.create_perspective(ADMIN, "P").await.unwrap().uuid;
    let q = core.create_perspective(ADMIN, "Q").await.unwrap().uuid;

    let request_id = core
        .request_capability(CapabilityRequest {
            app_name: "linker".into(),
            app_desc: "adds links to one perspective".into(),
            app_url: None,
            resources: vec![Resource::pointer(domains::PERSPECTIVE, p.to_string())],
            actions: vec![actions::CREATE.into(), actions::READ.into()],
        })
        .await
        .unwrap();
    let code = core.permit_capability(ADMIN, &request_id).await.unwrap();
    let jwt = core.generate_jwt(&code).await.unwrap().jwt;

    core.add_link(&jwt, p, abc()).await.unwrap();
    assert!(matches!(
        core.add_link(&jwt, q, abc()).await,
        Err(CoreError::Unauthorized { domain, pointer, action })
            if domain == domains::PERSPECTIVE && pointer == q.to_string() && action == actions::CREATE
    ));
    assert!(core.query_links(ADMIN, q, &LinkQuery::all()).unwrap().is_empty());

    // Listing is narrowed to what the token covers.
    let visible: Vec<_> = core.list_perspectives(&jwt).unwrap().into_iter().map(|h| h.uuid).collect();
    assert_eq!(visible, vec![p]);
    assert!(matches!(
        core.create_perspective(&jwt, "R").await,
        Err(CoreError::Unauthorized { .. })
    ));
    assert!(matches!(core.get_agent_status(&jwt), Err(CoreError::Unauthorized { .. })));
    assert!(matches!(
        core.get_perspective("not-a-token", p),
        Err(CoreError::InvalidToken(_))
    ));
}

#[test]
fn test_resolution_by_language_id() {
    let space = AddressSpace::new();
    let l1: Arc<dyn Language> = Arc::new(ContentLanguage::new("L1", AddressScheme::Hash));
    let l2: Arc<dyn Language> = Arc::new(ContentLanguage::new("L2", AddressScheme::Sequence));
    space.register("L1", l1.clone()).unwrap();
    space.register("L2", l2.clone()).unwrap();

    let resolved = space.resolve(&Address::parse("L1:xyz").unwrap()).unwrap();
    assert!(resolved.same_instance(&l1));
    assert!(!resolved.same_instance(&l2));
    assert!(matches!(
        space.resolve(&Address::parse("L3:xyz").unwrap()),
        Err(CoreError::AdapterNotFound(id)) if id == "L3"
    ));
}

#[tokio::test]
async fn test_link_set_properties() {
    let core = engine().await;
    let p = core.create_perspective(ADMIN, "P").await.unwrap().uuid;
    let mut added = core.subscribe(ADMIN, Topic::LinkAdded, Some(p)).unwrap();
    let mut removed = core.subscribe(ADMIN, Topic::LinkRemoved, Some(p)).unwrap();
    let mut updated = core.subscribe(ADMIN, Topic::LinkUpdated, Some(p)).unwrap();

    // Adding the same edge twice keeps one link and one event.
    let first = core.add_link(ADMIN, p, abc()).await.unwrap();
    let second = core.add_link(ADMIN, p, abc()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(core.perspective_snapshot(ADMIN, p).unwrap().links, vec![first.clone()]);

    // Removing an absent link is silent.
    let absent = LinkInput::new(node("x://1"), node("y://2"), node("z://3"));
    let absent = absent.into_link(first.author.clone());
    assert!(!core.remove_link(ADMIN, p, &absent).await.unwrap());

    // Same edge with a new timestamp is still exactly one update.
    let refreshed = core.update_link(ADMIN, p, &first, abc()).await.unwrap();
    assert!(refreshed.same_edge(&first));

    core.shutdown();
    let added: Vec<_> = added.by_ref().collect().await;
    assert_eq!(added.len(), 1);
    assert!(removed.next().await.is_none());
    let updates: Vec<_> = updated.by_ref().collect().await;
    assert_eq!(updates.len(), 1);
    assert!(matches!(
        &updates[0],
        Ok(ChangeEvent::LinkUpdated { old_link, new_link, .. }) if *old_link == first && *new_link == refreshed
    ));
}

#[tokio::test]
async fn test_subscriber_only_sees_its_perspective() {
    let core = engine().await;
    let x = core.create_perspective(ADMIN, "X").await.unwrap().uuid;
    let y = core.create_perspective(ADMIN, "Y").await.unwrap().uuid;
    let mut only_x = core.subscribe(ADMIN, Topic::LinkAdded, Some(x)).unwrap();

    core.add_link(ADMIN, y, abc()).await.unwrap();
    core.add_link(ADMIN, x, abc()).await.unwrap();
    core.add_link(ADMIN, y, LinkInput::new(node("d://4"), node("b://2"), node("c://3")))
        .await
        .unwrap();
    core.shutdown();

    let seen: Vec<_> = only_x.by_ref().collect().await;
    assert_eq!(seen.len(), 1);
    assert!(seen
        .iter()
        .all(|e| matches!(e, Ok(ChangeEvent::LinkAdded { perspective, .. }) if *perspective == x)));
}

#[tokio::test]
async fn test_slow_subscriber_is_disconnected_once() {
    let core = engine_with(CoreConfig {
        bus_capacity: 2,
        ..CoreConfig::ephemeral()
    })
    .await;
    let p = core.create_perspective(ADMIN, "P").await.unwrap().uuid;
    let mut slow = core.subscribe(ADMIN, Topic::LinkAdded, None).unwrap();

    // Publishing never waits for the subscriber.
    for i in 0..5 {
        let target = format!("t://{i}");
        core.add_link(ADMIN, p, LinkInput::new(node("a://1"), node("b://2"), node(&target)))
            .await
            .unwrap();
    }
    assert_eq!(core.query_links(ADMIN, p, &LinkQuery::all()).unwrap().len(), 5);

    assert!(matches!(slow.next().await, Some(Ok(ChangeEvent::LinkAdded { .. }))));
    assert!(matches!(slow.next().await, Some(Ok(ChangeEvent::LinkAdded { .. }))));
    assert!(matches!(slow.next().await, Some(Err(CoreError::SubscriberOverflow))));
    assert!(slow.next().await.is_none());
}

#[tokio::test]
async fn test_expressions_roundtrip_with_valid_proof() {
    let core = engine().await;
    core.install_language(Arc::new(ContentLanguage::new("notes", AddressScheme::Hash)))
        .await
        .unwrap();

    let address = core
        .create_expression(ADMIN, "notes", json!({"text": "hello"}))
        .await
        .unwrap();
    let expression = core.get_expression(ADMIN, &address).await.unwrap().unwrap();
    assert_eq!(expression.data, json!({"text": "hello"}));
    assert_eq!(expression.proof.valid, Some(true));

    let status = core.get_agent_status(ADMIN).unwrap();
    assert_eq!(status.did.as_deref(), Some(expression.author.as_str()));

    let missing = Address::parse("notes://nothing").unwrap();
    assert!(core.get_expression(ADMIN, &missing).await.unwrap().is_none());
    assert!(matches!(
        core.get_expression(ADMIN, &Address::parse("ghost://x").unwrap()).await,
        Err(CoreError::AdapterNotFound(_))
    ));
}

#[tokio::test]
async fn test_wrong_passphrase_keeps_agent_locked() {
    let core = engine().await;
    core.install_language(Arc::new(ContentLanguage::new("notes", AddressScheme::Hash)))
        .await
        .unwrap();

    core.lock_agent(ADMIN, "passphrase").await.unwrap();
    assert!(matches!(
        core.unlock_agent(ADMIN, "wrong").await,
        Err(CoreError::AuthenticationFailed)
    ));
    assert!(!core.get_agent_status(ADMIN).unwrap().is_unlocked);
    assert!(matches!(
        core.create_expression(ADMIN, "notes", json!("x")).await,
        Err(CoreError::AgentLocked)
    ));

    core.unlock_agent(ADMIN, "passphrase").await.unwrap();
    core.create_expression(ADMIN, "notes", json!("x")).await.unwrap();
}

#[tokio::test]
async fn test_agent_profile_follows_updates() {
    let core = engine().await;
    let mut updates = core.subscribe(ADMIN, Topic::AgentUpdated, None).unwrap();
    let public = Address::parse("notes://public-perspective").unwrap();

    let agent = core
        .update_agent_public_perspective(ADMIN, public.clone())
        .await
        .unwrap();
    assert_eq!(agent.perspective, Some(public.clone()));
    assert!(matches!(
        updates.next().await,
        Some(Ok(ChangeEvent::AgentUpdated { agent })) if agent.perspective == Some(public.clone())
    ));

    let profile = core.agent_by_did(ADMIN, &agent.did).await.unwrap().unwrap();
    assert_eq!(profile.perspective, Some(public));
}

/// Adapter whose reads park until released.
struct Gate {
    id: String,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Language for Gate {
    fn id(&self) -> &str {
        &self.id
    }

    fn interfaces(&self) -> Vec<&'static str> {
        vec![interfaces::EXPRESSION]
    }

    async fn get(&self, _content_id: &str) -> Result<Option<Expression>, AdapterError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(None)
    }

    async fn put(&self, _data: Value, _signer: &dyn ExpressionSigner) -> Result<Address, AdapterError> {
        Err("read only".into())
    }

    fn settings(&self) -> Value {
        Value::Null
    }

    fn put_settings(&self, _settings: Value) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_replacing_adapter_in_use_is_refused() {
    let core = Arc::new(engine().await);
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gate = |entered: &Arc<Notify>, release: &Arc<Notify>| {
        Arc::new(Gate {
            id: "slow".into(),
            entered: entered.clone(),
            release: release.clone(),
        })
    };
    core.install_language(gate(&entered, &release)).await.unwrap();

    let reader = {
        let core = core.clone();
        tokio::spawn(async move {
            let address = Address::parse("slow://anything").unwrap();
            core.get_expression(ADMIN, &address).await
        })
    };
    timeout(Duration::from_secs(5), entered.notified()).await.unwrap();

    assert!(matches!(
        core.install_language(gate(&entered, &release)).await,
        Err(CoreError::AdapterBusy(id)) if id == "slow"
    ));

    release.notify_one();
    assert!(reader.await.unwrap().unwrap().is_none());
    core.install_language(gate(&entered, &release)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mutations_are_serialized_in_event_order() {
    let core = Arc::new(
        engine_with(CoreConfig {
            bus_capacity: 4096,
            ..CoreConfig::ephemeral()
        })
        .await,
    );
    let did = core.get_agent(ADMIN).unwrap().did;
    let p = core.create_perspective(ADMIN, "P").await.unwrap().uuid;
    let q = core.create_perspective(ADMIN, "Q").await.unwrap().uuid;
    let mut added = core.subscribe(ADMIN, Topic::LinkAdded, Some(p)).unwrap();
    let mut removed = core.subscribe(ADMIN, Topic::LinkRemoved, Some(p)).unwrap();

    let shared_edge = |k: usize| LinkInput::new(node("s://hub"), node("rel://toggle"), node(&format!("t://{k}")));
    let mut tasks = Vec::new();
    // Writers add links nobody removes.
    for w in 0..8 {
        let core = core.clone();
        tasks.push(tokio::spawn(async move {
            for j in 0..25 {
                let target = format!("w://{w}-{j}");
                core.add_link(ADMIN, p, LinkInput::new(node("a://1"), node("b://2"), node(&target)))
                    .await
                    .unwrap();
                core.add_link(ADMIN, q, LinkInput::new(node("q://1"), node("b://2"), node(&target)))
                    .await
                    .unwrap();
            }
        }));
    }
    // Togglers race on the same four edges.
    for t in 0..4 {
        let core = core.clone();
        let did = did.clone();
        tasks.push(tokio::spawn(async move {
            for j in 0..25 {
                let edge = shared_edge((t + j) % 4);
                if (t + j) % 2 == 0 {
                    core.add_link(ADMIN, p, edge).await.unwrap();
                } else {
                    core.remove_link(ADMIN, p, &edge.into_link(did.clone())).await.unwrap();
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    let snapshot = core.perspective_snapshot(ADMIN, p).unwrap().links;
    assert_eq!(core.perspective_snapshot(ADMIN, q).unwrap().links.len(), 200);
    core.shutdown();

    let added: Vec<Link> = added
        .by_ref()
        .map(|e| match e {
            Ok(ChangeEvent::LinkAdded { perspective, link }) if perspective == p => link,
            other => panic!("unexpected event {other:?}"),
        })
        .collect()
        .await;
    let removed: Vec<Link> = removed
        .by_ref()
        .map(|e| match e {
            Ok(ChangeEvent::LinkRemoved { perspective, link }) if perspective == p => link,
            other => panic!("unexpected event {other:?}"),
        })
        .collect()
        .await;

    // Permanent links appear in the snapshot in the order they were announced.
    let is_written = |link: &Link| link.target.to_string().starts_with("w://");
    let announced: Vec<_> = added.iter().filter(|l| is_written(l)).cloned().collect();
    let kept: Vec<_> = snapshot.iter().filter(|l| is_written(l)).cloned().collect();
    assert_eq!(announced.len(), 200);
    assert_eq!(announced, kept);

    // Every toggled edge was added and removed alternately.
    let mut balance: HashMap<String, i32> = HashMap::new();
    for link in added.iter().filter(|l| !is_written(l)) {
        *balance.entry(link.target.to_string()).or_default() += 1;
    }
    for link in &removed {
        *balance.entry(link.target.to_string()).or_default() -= 1;
    }
    for k in 0..4 {
        let target = format!("t://{k}");
        let present = snapshot.iter().any(|l| l.target.to_string() == target);
        assert_eq!(balance.get(&target).copied().unwrap_or(0), i32::from(present), "{target}");
    }
}

/// Link sync whose commits park until released.
struct GatedLinks {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl LinkSyncAdapter for GatedLinks {
    async fn current_revision(&self) -> Result<Option<String>, AdapterError> {
        Ok(None)
    }

    async fn render(&self) -> Result<Vec<Link>, AdapterError> {
        Ok(Vec::new())
    }

    async fn commit(&self, _diff: PerspectiveDiff) -> Result<String, AdapterError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok("r1".into())
    }

    fn subscribe_remote_links(&self, _callback: RemoteLinksCallback) {}

    fn unsubscribe_remote_links(&self) {}
}

struct GatedLanguage(Arc<GatedLinks>);

#[async_trait]
impl Language for GatedLanguage {
    fn id(&self) -> &str {
        "gated"
    }

    fn interfaces(&self) -> Vec<&'static str> {
        vec![interfaces::LINK_SYNC]
    }

    async fn get(&self, _content_id: &str) -> Result<Option<Expression>, AdapterError> {
        Ok(None)
    }

    async fn put(&self, _data: Value, _signer: &dyn ExpressionSigner) -> Result<Address, AdapterError> {
        Err("links only".into())
    }

    fn settings(&self) -> Value {
        Value::Null
    }

    fn put_settings(&self, _settings: Value) -> Result<(), AdapterError> {
        Ok(())
    }

    fn link_sync(&self) -> Option<Arc<dyn LinkSyncAdapter>> {
        Some(self.0.clone())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_perspective_does_not_block_others() {
    let core = Arc::new(engine().await);
    let gate = Arc::new(GatedLinks {
        entered: Arc::new(Notify::new()),
        release: Arc::new(Notify::new()),
    });
    core.install_language(Arc::new(GatedLanguage(gate.clone()))).await.unwrap();

    let stalled = core.create_perspective(ADMIN, "stalled").await.unwrap().uuid;
    let free = core.create_perspective(ADMIN, "free").await.unwrap().uuid;
    let url = core.publish_perspective(ADMIN, stalled, "gated", vec![]).await.unwrap();
    assert_eq!(url.language(), NEIGHBOURHOOD_LANGUAGE_ID);

    let parked = {
        let core = core.clone();
        tokio::spawn(async move { core.add_link(ADMIN, stalled, abc()).await })
    };
    timeout(Duration::from_secs(5), gate.entered.notified()).await.unwrap();

    // The stalled perspective holds its turn; the other one does not wait.
    timeout(Duration::from_secs(5), core.add_link(ADMIN, free, abc()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(core.query_links(ADMIN, free, &LinkQuery::all()).unwrap().len(), 1);
    assert!(!parked.is_finished());

    gate.release.notify_one();
    parked.await.unwrap().unwrap();
    assert_eq!(core.query_links(ADMIN, stalled, &LinkQuery::all()).unwrap().len(), 1);
}
