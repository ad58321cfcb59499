//! Pairing and token handling through the facade.

use ad4m_core::{actions, domains, Ad4mCore, CapabilityRequest, CoreConfig, CoreError, Resource, Topic};

const ADMIN: &str = "admin-secret";

async fn engine(config: CoreConfig) -> Ad4mCore {
    Ad4mCore::open(CoreConfig {
        admin_credential: Some(ADMIN.into()),
        jwt_secret: Some("capability-secret".into()),
        ..config
    })
    .await
    .unwrap()
}

fn reader_app() -> CapabilityRequest {
    CapabilityRequest {
        app_name: "reader".into(),
        app_desc: "reads perspectives".into(),
        app_url: Some("https://reader.example".into()),
        resources: vec![Resource::domain(domains::PERSPECTIVE)],
        actions: vec![actions::READ.into(), actions::SUBSCRIBE.into()],
    }
}

#[tokio::test]
async fn test_code_redeems_exactly_once() {
    let core = engine(CoreConfig::ephemeral()).await;
    let request_id = core.request_capability(reader_app()).await.unwrap();
    let code = core.permit_capability(ADMIN, &request_id).await.unwrap();

    let issued = core.generate_jwt(&code).await.unwrap();
    assert_eq!(issued.token.subject, "reader");
    assert!(issued.token.expiry.is_some());
    assert!(matches!(core.generate_jwt(&code).await, Err(CoreError::CodeAlreadyUsed)));

    // The token does what it was granted and nothing more.
    assert!(core.list_perspectives(&issued.jwt).unwrap().is_empty());
    core.subscribe(&issued.jwt, Topic::LinkAdded, None).unwrap();
    assert!(matches!(
        core.create_perspective(&issued.jwt, "nope").await,
        Err(CoreError::Unauthorized { .. })
    ));
    assert!(matches!(
        core.subscribe(&issued.jwt, Topic::AgentUpdated, None),
        Err(CoreError::Unauthorized { .. })
    ));

    let apps = core.apps(ADMIN).unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].request.app_name, "reader");
    assert!(matches!(core.apps(&issued.jwt), Err(CoreError::Unauthorized { .. })));
}

#[tokio::test]
async fn test_stale_code_is_expired() {
    let core = engine(CoreConfig {
        pairing_code_ttl_secs: 0,
        ..CoreConfig::ephemeral()
    })
    .await;
    let request_id = core.request_capability(reader_app()).await.unwrap();
    let code = core.permit_capability(ADMIN, &request_id).await.unwrap();

    assert!(matches!(core.generate_jwt(&code).await, Err(CoreError::CodeExpired)));
    assert!(matches!(core.generate_jwt(&code).await, Err(CoreError::CodeExpired)));
}

#[tokio::test]
async fn test_permit_needs_authority_and_pending_request() {
    let core = engine(CoreConfig::ephemeral()).await;
    let request_id = core.request_capability(reader_app()).await.unwrap();

    assert!(matches!(
        core.permit_capability("forged", &request_id).await,
        Err(CoreError::InvalidToken(_))
    ));
    core.permit_capability(ADMIN, &request_id).await.unwrap();
    assert!(matches!(
        core.permit_capability(ADMIN, &request_id).await,
        Err(CoreError::RequestNotPending(_))
    ));
    assert!(matches!(
        core.permit_capability(ADMIN, "unknown").await,
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(core.generate_jwt("123456").await, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn test_tokens_from_another_engine_are_rejected() {
    let ours = engine(CoreConfig::ephemeral()).await;
    let theirs = Ad4mCore::open(CoreConfig {
        admin_credential: Some(ADMIN.into()),
        jwt_secret: Some("some-other-secret".into()),
        ..CoreConfig::ephemeral()
    })
    .await
    .unwrap();

    let request_id = theirs.request_capability(reader_app()).await.unwrap();
    let code = theirs.permit_capability(ADMIN, &request_id).await.unwrap();
    let jwt = theirs.generate_jwt(&code).await.unwrap().jwt;

    assert!(theirs.list_perspectives(&jwt).is_ok());
    assert!(matches!(ours.list_perspectives(&jwt), Err(CoreError::InvalidToken(_))));
}

#[tokio::test]
async fn test_without_admin_credential_nothing_is_admin() {
    let core = Ad4mCore::open(CoreConfig::ephemeral()).await.unwrap();
    assert!(matches!(core.get_agent_status(""), Err(CoreError::InvalidToken(_))));
    assert!(matches!(core.get_agent_status(ADMIN), Err(CoreError::InvalidToken(_))));
}
