//! Rendering through a session with a scripted engine

mod common;

use common::{late_page, StubLauncher};
use rfhtml::{
    AsyncSession, CookieParam, EngineState, Error, LoadEvent, RenderOptions, Session, SessionConfig,
};
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn session() -> (Session, std::sync::Arc<common::StubState>) {
    let (state, launcher) = StubLauncher::new().shared();
    let session = Session::with_launcher(SessionConfig::default(), launcher).unwrap();
    (session, state)
}

#[test]
fn render_materializes_script_content() {
    let (session, _state) = session();
    let mut doc = session.html(&late_page(50), "http://test/late.html").unwrap();

    assert!(doc.find_first("#late").unwrap().is_none());

    doc.render(&RenderOptions::default()).unwrap();
    let late = doc.find_first("#late").unwrap().expect("rendered element");
    assert_eq!(late.text(), "ok");
    assert!(doc.is_rendered());
    session.close().unwrap();
}

#[test]
fn static_elements_survive_render() {
    let (session, _state) = session();
    let mut doc = session.html(&late_page(0), "http://test/late.html").unwrap();
    let before = doc.find_first("#static").unwrap().unwrap();
    let static_tree = doc.static_tree();

    doc.render(&RenderOptions::default()).unwrap();

    assert_eq!(before.text(), "here");
    assert!(Rc::ptr_eq(before.tree(), &static_tree));
    assert!(!Rc::ptr_eq(&doc.current_tree(), &static_tree));
    assert!(static_tree.select("#late", false).unwrap().is_empty());

    let after = doc.find_first("#static").unwrap().unwrap();
    assert_eq!(after.text(), before.text());
    assert_ne!(after, before);
}

#[test]
fn script_result_is_returned() {
    let (session, _state) = session();
    let mut doc = session.html(&late_page(0), "http://test/late.html").unwrap();
    let result = doc
        .render(&RenderOptions::with_script("() => document.title"))
        .unwrap()
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.json(), Some(serde_json::json!("late")));

    let thrown = doc.render(&RenderOptions::with_script("throw new Error('x')")).unwrap().unwrap();
    assert!(thrown.is_error);
    assert!(doc.is_rendered());
}

#[test]
fn engine_launches_once_per_session() {
    let (session, state) = session();
    assert_eq!(session.manager().state(), EngineState::Unstarted);
    for _ in 0..3 {
        let mut doc = session.html("<p>x</p>", "http://test/").unwrap();
        doc.render(&RenderOptions::default()).unwrap();
    }
    assert_eq!(state.launches.load(Ordering::SeqCst), 1);
    assert_eq!(state.pages_opened.load(Ordering::SeqCst), 3);
    assert_eq!(state.pages_closed.load(Ordering::SeqCst), 3);
    assert_eq!(session.manager().state(), EngineState::Ready);
}

#[test]
fn timeout_is_reported_and_engine_restarted() {
    let (session, state) = session();
    let mut slow = session.html("<p>stub:hang</p>", "http://test/slow").unwrap();
    let opts = RenderOptions { timeout: Duration::from_millis(150), ..Default::default() };

    let err = slow.render(&opts).unwrap_err();
    assert!(matches!(err, Error::RenderTimeout(150)));
    assert!(err.is_render_failure());
    assert!(!slow.is_rendered());
    assert_eq!(slow.find("p").unwrap().len(), 1);

    let mut fast = session.html("<p>fine</p>", "http://test/fast").unwrap();
    fast.render(&RenderOptions::default()).unwrap();
    assert_eq!(state.launches.load(Ordering::SeqCst), 2);
    assert_eq!(state.engine_closes.load(Ordering::SeqCst), 1);
}

#[test]
fn retries_cover_launch_failures() {
    let launcher = StubLauncher::new();
    launcher.state.failing_launches.store(2, Ordering::SeqCst);
    let (state, launcher) = launcher.shared();
    let session = Session::with_launcher(SessionConfig::default(), launcher).unwrap();

    let mut doc = session.html("<p>x</p>", "http://test/").unwrap();
    let once = doc.render(&RenderOptions::default());
    assert!(matches!(once, Err(Error::EngineLaunch(_))));

    let patient = RenderOptions { retries: 2, ..Default::default() };
    doc.render(&patient).unwrap();
    assert_eq!(state.launches.load(Ordering::SeqCst), 1);
}

#[test]
fn close_is_idempotent_and_final() {
    let (never_rendered, state) = session();
    never_rendered.close().unwrap();
    never_rendered.close().unwrap();
    assert_eq!(state.engine_closes.load(Ordering::SeqCst), 0);

    let (session, state) = session();
    let mut doc = session.html("<p>x</p>", "http://test/").unwrap();
    doc.render(&RenderOptions::default()).unwrap();
    session.close().unwrap();
    session.close().unwrap();
    assert_eq!(state.engine_closes.load(Ordering::SeqCst), 1);
    assert_eq!(session.manager().state(), EngineState::Closed);

    assert!(matches!(doc.render(&RenderOptions::default()), Err(Error::EngineClosed)));
    assert!(doc.is_rendered());
}

#[test]
fn incremental_render_starts_from_rendered_markup() {
    let (session, _state) = session();
    let mut doc = session.html(&late_page(0), "http://test/late.html").unwrap();
    doc.render(&RenderOptions::default()).unwrap();
    assert_eq!(doc.find("#late").unwrap().len(), 1);

    // the stub appends again when the rendered markup still carries the script
    let incremental = RenderOptions { incremental: true, ..Default::default() };
    doc.render(&incremental).unwrap();
    assert_eq!(doc.find("#late").unwrap().len(), 2);

    doc.render(&RenderOptions::default()).unwrap();
    assert_eq!(doc.find("#late").unwrap().len(), 1);
}

#[test]
fn reload_navigates_live_url() {
    let (session, state) = session();
    state
        .sites
        .lock()
        .unwrap()
        .insert("http://test/live".into(), "<p id=live>fresh</p>".into());
    let mut doc = session.html("<p id=live>stale</p>", "http://test/live").unwrap();

    doc.render(&RenderOptions { reload: true, ..Default::default() }).unwrap();
    assert_eq!(doc.find_first("#live").unwrap().unwrap().text(), "fresh");
    assert!(state.events().iter().any(|e| e.step == "goto"));
}

#[test]
fn wait_until_runs_between_load_and_serialize() {
    let (session, state) = session();
    let mut doc = session.html("<p>x</p>", "http://test/").unwrap();
    let opts = RenderOptions { wait_until: Some(LoadEvent::NetworkIdle), ..Default::default() };
    doc.render(&opts).unwrap();

    let steps: Vec<&str> = state.events().iter().filter(|e| e.enter).map(|e| e.step).collect();
    assert_eq!(steps, vec!["set_content", "evaluate", "content"]);
}

#[test]
fn scrolls_are_performed() {
    let (session, state) = session();
    let mut doc = session.html("<p>long</p>", "http://test/").unwrap();
    let opts = RenderOptions {
        scroll_down: 3,
        sleep: Duration::from_millis(10),
        ..Default::default()
    };
    doc.render(&opts).unwrap();
    let scrolls = state.events().iter().filter(|e| e.step == "scroll" && e.enter).count();
    assert_eq!(scrolls, 3);
}

#[test]
fn kept_page_stays_open_until_closed() {
    let (session, state) = session();
    let mut doc = session.html("<p>kept</p>", "http://test/").unwrap();
    doc.render(&RenderOptions { keep_page: true, ..Default::default() }).unwrap();

    assert_eq!(session.manager().kept_pages(), 1);
    let page = doc.page().expect("kept page");
    assert!(page.content(Duration::from_secs(1)).unwrap().contains("kept"));

    doc.take_page().unwrap().close().unwrap();
    assert_eq!(session.manager().kept_pages(), 0);
    assert_eq!(state.pages_closed.load(Ordering::SeqCst), 1);
}

#[test]
fn cookies_and_user_agent_reach_the_page() {
    let (session, state) = session();
    let url = url::Url::parse("http://test/").unwrap();
    session.cookie_jar().add_cookie_str("sid=s1; Path=/", &url);

    let mut doc = session.html("<p>x</p>", "http://test/").unwrap();
    let opts = RenderOptions {
        cookies: vec![CookieParam::for_url("extra", "1", "http://test/")],
        send_session_cookies: true,
        ..Default::default()
    };
    doc.render(&opts).unwrap();

    let names: Vec<String> = state.cookies.lock().unwrap().iter().map(|c| c.name.clone()).collect();
    assert_eq!(names, vec!["extra", "sid"]);
    assert_eq!(
        state.user_agents.lock().unwrap().as_slice(),
        &[rfhtml::DEFAULT_USER_AGENT.to_string()]
    );
}

#[tokio::test]
async fn async_session_markup_forwards_session_cookies() {
    let (state, launcher) = StubLauncher::new().shared();
    let session = AsyncSession::with_launcher(SessionConfig::default(), launcher).unwrap();
    let url = url::Url::parse("http://test/").unwrap();
    session.cookie_jar().add_cookie_str("sid=s2; Path=/", &url);

    let mut doc = session.html("<p>x</p>", "http://test/").unwrap();
    let opts = RenderOptions { send_session_cookies: true, ..Default::default() };
    doc.render_async(&opts).await.unwrap();

    let cookies = state.cookies.lock().unwrap().clone();
    assert_eq!(cookies, vec![CookieParam::for_url("sid", "s2", "http://test/")]);
    session.close().await.unwrap();
}
