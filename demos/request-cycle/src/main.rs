use std::net::IpAddr;
use std::time::Duration;

use keepsake::prelude::*;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// A tiny "web app"
// ---------------------------------------------------------------------------

/// What the browser holds between requests.
#[derive(Default)]
struct Browser {
    cookie: Option<String>,
}

/// One page view: counts visits, flashes a notice on login, keeps a
/// short-lived one-time code around.
async fn visit(
    manager: &SessionManager,
    browser: &mut Browser,
    ip: IpAddr,
    login: bool,
) -> Result<u64, KeepsakeError> {
    let mut session = manager.start(browser.cookie.as_deref(), Some(ip)).await?;

    if let Some(notice) = session.data().get_flash::<String>("notice") {
        tracing::info!(%notice, "showing flash message");
    }
    if let Some(code) = session.data().get_temp::<String>("otp") {
        tracing::info!(%code, "one-time code still valid");
    }

    let visits = session.data().get::<u64>("visits").unwrap_or(0) + 1;
    session.data_mut().set("visits", visits)?;

    if login {
        session.data_mut().set_flash("notice", "welcome back")?;
        let now = session.now();
        session.data_mut().set_temp("otp", "493-112", 2, now)?;
        session.regenerate(true).await?;
    }

    if session.id_changed() {
        tracing::info!(session_id = %session.id(), "Set-Cookie");
        browser.cookie = Some(session.id().to_string());
    }
    session.commit().await?;
    Ok(visits)
}

async fn logout(manager: &SessionManager, browser: &mut Browser) -> Result<(), KeepsakeError> {
    let session = manager.start(browser.cookie.as_deref(), None).await?;
    session.destroy().await?;
    browser.cookie = None;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,keepsake=debug")),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let manager = SessionManager::builder()
        .driver("files")
        .save_path(dir.path().to_string_lossy())
        .cookie_name("demo_session")
        .build()?;

    let ip: IpAddr = "127.0.0.1".parse()?;
    let mut browser = Browser::default();

    visit(&manager, &mut browser, ip, false).await?;
    visit(&manager, &mut browser, ip, true).await?;
    visit(&manager, &mut browser, ip, false).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let visits = visit(&manager, &mut browser, ip, false).await?;
    tracing::info!(visits, "done browsing");

    logout(&manager, &mut browser).await?;
    let removed = manager.collect(Duration::from_secs(1440)).await?;
    tracing::info!(removed, "garbage collection finished");
    Ok(())
}
