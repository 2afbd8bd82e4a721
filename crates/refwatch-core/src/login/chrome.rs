// Headless Chrome implementation of the login driver
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use super::{
    DriverError, DriverResult, LoginDriver, LoginSessionFactory, EMAIL_FIELD_ID, PASSWORD_FIELD_ID,
    SUBMIT_BUTTON_ID,
};

const POLL_EVERY: Duration = Duration::from_millis(250);

/// Launches a fresh Chrome process per sign-in
pub struct ChromeLoginFactory {
    chrome_path: Option<PathBuf>,
    headless: bool,
    app_url: String,
}

impl ChromeLoginFactory {
    pub fn new(chrome_path: Option<PathBuf>, headless: bool, app_url: impl Into<String>) -> Self {
        Self {
            chrome_path,
            headless,
            app_url: app_url.into(),
        }
    }

    pub fn from_config(config: &crate::Config) -> Self {
        Self::new(
            config.browser.chrome_path.clone(),
            config.browser.headless,
            config.upstream.app_url.clone(),
        )
    }
}

#[async_trait]
impl LoginSessionFactory for ChromeLoginFactory {
    async fn open(&self) -> DriverResult<Box<dyn LoginDriver>> {
        let mut builder = BrowserConfig::builder();
        if let Some(path) = &self.chrome_path {
            builder = builder.chrome_executable(path);
        }
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(DriverError::new)?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(DriverError::new)?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let mut session = ChromeSession {
            browser,
            page: None,
            handler_task,
            app_url: self.app_url.clone(),
        };

        match session.browser.new_page("about:blank").await {
            Ok(page) => {
                session.page = Some(page);
                debug!("browser session opened");
                Ok(Box::new(session))
            }
            Err(e) => {
                // Tear the process down before reporting
                let _ = session.close().await;
                Err(DriverError::new(e))
            }
        }
    }
}

/// A running Chrome process with one tab
pub struct ChromeSession {
    browser: Browser,
    page: Option<Page>,
    handler_task: JoinHandle<()>,
    app_url: String,
}

impl ChromeSession {
    fn page(&self) -> DriverResult<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| DriverError::new("browser tab is not open"))
    }

    async fn type_into(&self, field_id: &str, text: &str) -> DriverResult<()> {
        let element = self
            .page()?
            .find_element(format!("#{}", field_id))
            .await
            .map_err(|e| DriverError::new(format!("field #{} not found: {}", field_id, e)))?;
        element.click().await.map_err(DriverError::new)?;
        element.type_str(text).await.map_err(DriverError::new)?;
        Ok(())
    }
}

#[async_trait]
impl LoginDriver for ChromeSession {
    async fn navigate_to_login(&mut self) -> DriverResult<()> {
        self.page()?
            .goto(self.app_url.as_str())
            .await
            .map_err(DriverError::new)?;
        Ok(())
    }

    async fn wait_for_field(&mut self, id: &str, wait: Duration) -> DriverResult<()> {
        let page = self.page()?;
        let selector = format!("#{}", id);

        timeout(wait, async {
            loop {
                if page.find_element(selector.clone()).await.is_ok() {
                    return;
                }
                sleep(POLL_EVERY).await;
            }
        })
        .await
        .map_err(|_| DriverError::new(format!("field #{} did not appear within {:?}", id, wait)))
    }

    async fn submit_credentials(&mut self, email: &str, password: &str) -> DriverResult<()> {
        self.type_into(EMAIL_FIELD_ID, email).await?;
        self.type_into(PASSWORD_FIELD_ID, password).await?;

        let submit = self
            .page()?
            .find_element(format!("#{}", SUBMIT_BUTTON_ID))
            .await
            .map_err(|e| DriverError::new(format!("submit button not found: {}", e)))?;
        submit.press_key("Enter").await.map_err(DriverError::new)?;
        Ok(())
    }

    async fn wait_for_redirect(&mut self, pattern: &Regex, wait: Duration) -> DriverResult<()> {
        let page = self.page()?;
        let deadline = Instant::now() + wait;
        let mut last_url = None;

        while Instant::now() < deadline {
            if let Ok(Some(url)) = page.url().await {
                if pattern.is_match(&url) {
                    debug!(url = %url, "redirect observed");
                    return Ok(());
                }
                last_url = Some(url);
            }
            sleep(POLL_EVERY).await;
        }

        Err(DriverError::new(format!(
            "URL never matched /{}/ within {:?} (last seen: {})",
            pattern.as_str(),
            wait,
            last_url.unwrap_or_else(|| "<none>".into())
        )))
    }

    async fn read_session_storage(
        &mut self,
        keys: &[&str],
    ) -> DriverResult<HashMap<String, Option<String>>> {
        let keys_json = serde_json::to_string(keys).map_err(DriverError::new)?;
        // Stringify in the page so missing keys come back as JSON nulls
        let script = format!(
            "JSON.stringify(Object.fromEntries({}.map(k => [k, window.sessionStorage.getItem(k)])))",
            keys_json
        );

        let raw: String = self
            .page()?
            .evaluate(script)
            .await
            .map_err(DriverError::new)?
            .into_value()
            .map_err(DriverError::new)?;

        serde_json::from_str(&raw).map_err(DriverError::new)
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.page = None;
        let closed = self.browser.close().await.map_err(DriverError::new);
        if closed.is_ok() {
            let _ = self.browser.wait().await;
        }
        self.handler_task.abort();
        debug!("browser session closed");
        closed.map(|_| ())
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        // chromiumoxide kills the child process when `Browser` drops
        self.handler_task.abort();
    }
}
