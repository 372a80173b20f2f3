use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
    time::Duration,
};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{
    header::{HeaderMap, COOKIE, LOCATION, SET_COOKIE},
    Method, Url,
};
use serde_json::{json, Value};
use time::Date;

use super::{Credentials, PortalClient, PortalError};
use crate::{session::SessionArtifact, transform::RawPayload};

/// Form field carrying the member id on the login page.
pub const LOGIN_ID_FIELD: &str = "body_1$TxtKaiinId";
pub const PASSWORD_FIELD: &str = "body_1$TxtPasswd";
/// Hidden input holding the HTML-escaped chart JSON.
pub const CHART_DATA_FIELD: &str = "body_0$Data";

const MAX_REDIRECTS: usize = 8;

static INPUT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<input\b[^>]*>").expect("static regex"));
static ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)([a-z_:][\w:.$-]*)\s*=\s*"([^"]*)""#).expect("static regex"));

#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub base_url: String,
    pub login_path: String,
    pub member_path: String,
    pub daily_path: String,
    pub hourly_path: String,
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            base_url: "https://my.kyuden.co.jp".to_string(),
            login_path: "/member/".to_string(),
            member_path: "/member/".to_string(),
            daily_path: "/member/chart_days_current".to_string(),
            hourly_path: "/member/chart_hours_current".to_string(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

struct Page {
    url: Url,
    body: String,
}

/// Cookie-jar client for the member portal.
///
/// Redirects are followed by hand so that cookies set on intermediate
/// responses (the login post-back answers with a 302) end up in the jar.
pub struct HttpPortalClient {
    client: reqwest::Client,
    base: Url,
    settings: PortalSettings,
    cookies: Mutex<BTreeMap<String, String>>,
}

impl HttpPortalClient {
    pub fn new(settings: PortalSettings) -> Result<Self, PortalError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .timeout(settings.request_timeout)
            .build()?;
        let base = Url::parse(&settings.base_url)
            .map_err(|e| PortalError::Transport(format!("invalid portal base url: {e}")))?;

        Ok(Self {
            client,
            base,
            settings,
            cookies: Mutex::new(BTreeMap::new()),
        })
    }

    fn url(&self, path: &str) -> Result<Url, PortalError> {
        self.base
            .join(path)
            .map_err(|e| PortalError::Transport(format!("invalid portal path '{path}': {e}")))
    }

    fn jar(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // A poisoned jar only means another request panicked mid-update.
        self.cookies.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cookie_header(&self) -> Option<String> {
        let jar = self.jar();
        if jar.is_empty() {
            return None;
        }
        Some(
            jar.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn absorb_cookies(&self, headers: &HeaderMap) {
        let mut jar = self.jar();
        for raw in headers.get_all(SET_COOKIE) {
            let Ok(raw) = raw.to_str() else { continue };
            let pair = raw.split(';').next().unwrap_or_default();
            let Some((name, value)) = pair.split_once('=') else { continue };
            let (name, value) = (name.trim(), value.trim());
            let expired = raw.to_ascii_lowercase().contains("max-age=0");
            if value.is_empty() || expired {
                jar.remove(name);
            } else {
                jar.insert(name.to_string(), value.to_string());
            }
        }
    }

    async fn navigate(
        &self,
        mut method: Method,
        mut url: Url,
        mut form: Option<Vec<(String, String)>>,
    ) -> Result<Page, PortalError> {
        for _ in 0..=MAX_REDIRECTS {
            let mut req = self.client.request(method.clone(), url.clone());
            if let Some(cookie) = self.cookie_header() {
                req = req.header(COOKIE, cookie);
            }
            if let Some(fields) = &form {
                req = req.form(fields);
            }

            let resp = req.send().await?;
            self.absorb_cookies(resp.headers());
            let status = resp.status();

            if status.is_redirection() {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| PortalError::UnexpectedPage(format!("{status} without Location at {url}")))?;
                url = url
                    .join(location)
                    .map_err(|e| PortalError::UnexpectedPage(format!("bad redirect target '{location}': {e}")))?;
                method = Method::GET;
                form = None;
                tracing::debug!(%url, "following portal redirect");
                continue;
            }

            if !status.is_success() {
                return Err(PortalError::UnexpectedPage(format!("{status} at {url}")));
            }

            let body = resp.text().await?;
            return Ok(Page { url, body });
        }

        Err(PortalError::UnexpectedPage(format!("too many redirects ending at {url}")))
    }

    /// The login form is showing, or we were redirected onto a login page
    /// distinct from the member page.
    fn is_login_page(&self, page: &Page) -> Result<bool, PortalError> {
        if has_login_form(&page.body) {
            return Ok(true);
        }
        let login = self.url(&self.settings.login_path)?;
        let member = self.url(&self.settings.member_path)?;
        Ok(login.path() != member.path() && page.url.path() == login.path())
    }

    async fn fetch_chart(&self, path: &str) -> Result<RawPayload, PortalError> {
        let page = self.navigate(Method::GET, self.url(path)?, None).await?;
        if self.is_login_page(&page)? {
            return Err(PortalError::UnexpectedPage(format!(
                "login form returned for {}; session expired",
                page.url
            )));
        }

        let raw = input_value(&page.body, CHART_DATA_FIELD)
            .ok_or_else(|| PortalError::Payload(format!("'{CHART_DATA_FIELD}' input not found")))?;
        if raw.trim().is_empty() {
            return Err(PortalError::Payload("chart data is empty".to_string()));
        }

        serde_json::from_str(&unescape_html(&raw)).map_err(|e| PortalError::Payload(format!("chart data is not JSON: {e}")))
    }
}

#[async_trait::async_trait]
impl PortalClient for HttpPortalClient {
    async fn is_session_valid(&self) -> Result<bool, PortalError> {
        if self.jar().is_empty() {
            return Ok(false);
        }
        let page = self
            .navigate(Method::GET, self.url(&self.settings.member_path)?, None)
            .await?;
        Ok(!self.is_login_page(&page)?)
    }

    async fn login(&self, credentials: &Credentials) -> Result<bool, PortalError> {
        let page = self
            .navigate(Method::GET, self.url(&self.settings.login_path)?, None)
            .await?;

        if !has_login_form(&page.body) {
            let member = page.url.path().contains("/member/");
            tracing::info!(url = %page.url, member, "login page did not show a login form");
            return Ok(member);
        }

        let mut form: Vec<(String, String)> = hidden_fields(&page.body)
            .into_iter()
            .filter(|(name, _)| name != LOGIN_ID_FIELD && name != PASSWORD_FIELD)
            .collect();
        form.push((LOGIN_ID_FIELD.to_string(), credentials.username.clone()));
        form.push((PASSWORD_FIELD.to_string(), credentials.password.clone()));

        let result = self.navigate(Method::POST, page.url.clone(), Some(form)).await?;
        let ok = result.url.path().contains("/member/") && !has_login_form(&result.body);
        if !ok {
            tracing::warn!(url = %result.url, "portal rejected login");
        }
        Ok(ok)
    }

    async fn fetch_daily_usage(&self) -> Result<RawPayload, PortalError> {
        self.fetch_chart(&self.settings.daily_path).await
    }

    async fn fetch_hourly_usage(&self, target: Option<Date>) -> Result<RawPayload, PortalError> {
        // The hourly chart always renders the portal's current day; the
        // target only decides how the caller attributes the values.
        tracing::debug!(?target, "fetching hourly chart");
        self.fetch_chart(&self.settings.hourly_path).await
    }

    async fn restore_session(&self, artifact: &SessionArtifact) -> Result<(), PortalError> {
        let cookies = artifact
            .state
            .get("cookies")
            .and_then(Value::as_object)
            .ok_or_else(|| PortalError::SessionState("artifact has no cookie map".to_string()))?;

        let mut jar = self.jar();
        jar.clear();
        for (name, value) in cookies {
            if let Some(v) = value.as_str() {
                jar.insert(name.clone(), v.to_string());
            }
        }
        Ok(())
    }

    async fn export_session(&self) -> Result<SessionArtifact, PortalError> {
        let jar = self.jar();
        if jar.is_empty() {
            return Err(PortalError::SessionState("no cookies to export".to_string()));
        }
        Ok(SessionArtifact::new(json!({ "cookies": &*jar })))
    }

    async fn reset_session(&self) -> Result<(), PortalError> {
        self.jar().clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), PortalError> {
        self.jar().clear();
        tracing::debug!("portal client closed");
        Ok(())
    }
}

fn has_login_form(html: &str) -> bool {
    html.contains(LOGIN_ID_FIELD)
}

fn input_attributes(tag: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(tag)
        .map(|c| (c[1].to_ascii_lowercase(), c[2].to_string()))
        .collect()
}

/// `(name, value)` of every hidden input on the page, values unescaped.
fn hidden_fields(html: &str) -> Vec<(String, String)> {
    INPUT_TAG
        .find_iter(html)
        .map(|m| input_attributes(m.as_str()))
        .filter(|attrs| attrs.get("type").is_some_and(|t| t.eq_ignore_ascii_case("hidden")))
        .filter_map(|mut attrs| {
            let name = attrs.remove("name")?;
            let value = attrs.remove("value").unwrap_or_default();
            Some((unescape_html(&name), unescape_html(&value)))
        })
        .collect()
}

/// Raw (still escaped) value attribute of the input named `name`.
fn input_value(html: &str, name: &str) -> Option<String> {
    INPUT_TAG
        .find_iter(html)
        .map(|m| input_attributes(m.as_str()))
        .find(|attrs| attrs.get("name").is_some_and(|n| n == name))
        .map(|mut attrs| attrs.remove("value").unwrap_or_default())
}

/// Decode the character references ASP.NET emits in attribute values.
fn unescape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';').filter(|&i| i <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };

        let entity = &tail[1..semi];
        let decoded = match entity {
            "quot" => Some('"'),
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };

        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}
