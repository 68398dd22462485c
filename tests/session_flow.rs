use safari_bridge::testing::{element_json, extraction_json, test_config, MockBrowser, MockScripting};
use safari_bridge::{
    register_handlers, BridgeError, BrowserEvent, EventBus, EventOutcome, SafariSession,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_test::assert_ok;

const EXTRACTION_SCRIPT: &str = safari_bridge::dom::EXTRACTION_SCRIPT;

async fn started_session(
    browser: &Arc<MockBrowser>,
    os: &Arc<MockScripting>,
    config: safari_bridge::Config,
) -> Arc<Mutex<SafariSession>> {
    let mut session = SafariSession::new(config, browser.clone(), os.clone());
    assert_ok!(session.start().await);
    Arc::new(Mutex::new(session))
}

#[tokio::test]
async fn agent_turn_over_the_bus() {
    let browser = Arc::new(MockBrowser::new());
    let mut buy = element_json(2, "button", "Buy", (100.0, 200.0, 80.0, 30.0));
    buy["css_selector"] = json!("#buy");
    browser.reply(
        EXTRACTION_SCRIPT,
        Ok(extraction_json(vec![
            element_json(1, "a", "Home", (0.0, 0.0, 40.0, 20.0)),
            buy,
        ])),
    );
    browser.reply(
        safari_bridge::utils::javascript::SCROLL_INTO_VIEW_SCRIPT,
        Ok(json!({"x": 100.0, "y": 200.0, "width": 80.0, "height": 30.0})),
    );
    let os = Arc::new(MockScripting::new());
    let session = started_session(&browser, &os, test_config()).await;
    let bus = EventBus::new();
    register_handlers(&session, &bus).await;

    let navigated = bus
        .dispatch(BrowserEvent::Navigate {
            url: "example.com".into(),
            new_tab: false,
        })
        .await
        .unwrap();
    assert_eq!(navigated, EventOutcome::Done);

    let state = bus
        .dispatch(BrowserEvent::BrowserStateRequest {
            include_dom: true,
            include_screenshot: false,
            include_recent_events: true,
        })
        .await
        .unwrap();
    let EventOutcome::State(summary) = state else {
        panic!("expected a state outcome");
    };
    assert_eq!(summary.dom.element_count(), 2);
    assert!(summary
        .recent_events
        .as_deref()
        .unwrap_or_default()
        .contains("navigate:https://example.com/"));

    let node = summary.dom.selector_map.get(&2).cloned().unwrap();
    let clicked = bus.dispatch(BrowserEvent::ClickElement { node }).await.unwrap();
    assert_eq!(clicked, EventOutcome::Click { x: 140, y: 215 });

    let guard = session.lock().await;
    assert!(guard.recent_events().contains("click:2"));
    assert!(guard.cached_summary().is_none());
}

#[tokio::test]
async fn downloads_are_announced_once() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let mut config = test_config();
    config.downloads.downloads_path = Some(root.clone());

    let browser = Arc::new(MockBrowser::new());
    let os = Arc::new(MockScripting::new());
    let session = started_session(&browser, &os, config).await;
    let bus = EventBus::new();
    register_handlers(&session, &bus).await;

    std::fs::write(root.join("invoice.pdf"), b"%PDF").unwrap();
    std::fs::write(root.join("video.mp4.download"), b"partial").unwrap();
    assert_ok!(
        bus.dispatch(BrowserEvent::ClickCoordinate { x: 10.0, y: 10.0 })
            .await
    );
    tokio::time::sleep(Duration::from_millis(20)).await;

    let guard = session.lock().await;
    assert_eq!(guard.downloaded_files(), vec![root.join("invoice.pdf")]);
    assert!(guard.recent_events().contains("download:invoice.pdf"));
}

#[tokio::test]
async fn storage_state_moves_between_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");

    let source = Arc::new(MockBrowser::new());
    source.add_stored_cookie(
        serde_json::from_value(json!({
            "name": "sid", "value": "42", "domain": ".shop.test", "secure": true
        }))
        .unwrap(),
    );
    let os = Arc::new(MockScripting::new());
    let first = started_session(&source, &os, test_config()).await;
    assert_ok!(first.lock().await.save_storage_state(&path).await);

    let target = Arc::new(MockBrowser::new());
    let mut config = test_config();
    config.session.storage_state = Some(path.clone());
    let second = started_session(&target, &os, config).await;

    assert_eq!(target.visited(), vec!["https://shop.test/".to_string()]);
    let cookies = second.lock().await.cookies().await.unwrap();
    assert_eq!(cookies.len(), 1);
    assert_eq!(cookies[0].value, "42");
}

#[tokio::test]
async fn tabs_open_and_close_by_target_id() {
    let browser = Arc::new(MockBrowser::new());
    let os = Arc::new(MockScripting::new());
    let session = started_session(&browser, &os, test_config()).await;
    let mut guard = session.lock().await;

    guard.navigate("https://docs.test/", true).await.unwrap();
    let tabs = guard.tab_list().await.unwrap();
    assert_eq!(tabs.len(), 2);
    let newest = guard.most_recently_opened_target().await.unwrap();
    assert_eq!(guard.focused_target(), Some(newest.as_str()));

    guard.close_tab(&newest).await.unwrap();
    let remaining = guard.tab_list().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].target_id, newest);

    let err = guard.close_tab(&newest).await.unwrap_err();
    assert!(matches!(err, BridgeError::Operation { .. }));
}

#[tokio::test]
async fn stopped_session_refuses_work() {
    let browser = Arc::new(MockBrowser::new());
    let os = Arc::new(MockScripting::new());
    let session = started_session(&browser, &os, test_config()).await;
    let mut guard = session.lock().await;
    assert_ok!(guard.stop().await);

    let err = guard
        .handle_event(BrowserEvent::SendKeys { keys: "Enter".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::NotStarted));
}
