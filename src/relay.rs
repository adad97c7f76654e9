// 中继客户端：把聊天文本转发给只能经私有叠加网络访问的机器人服务。
use crate::config::RelayConfig;
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

const SECRET_HEADER: &str = "x-relay-secret";
const DEFAULT_TIMEOUT_S: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Direct,
    Proxy,
}

#[derive(Clone)]
pub struct RelayClient {
    http: Client,
    config: RelayConfig,
}

impl RelayClient {
    pub fn new(config: RelayConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(effective_timeout_s(&config)))
            .build()
            .unwrap_or_else(|err| {
                warn!("构建 HTTP 客户端失败，回退默认客户端: {err}");
                Client::new()
            });
        Self { http, config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.endpoint().is_some() && self.config.secret().is_some()
    }

    /// 发送一轮聊天文本。成功返回机器人应答（允许缺失），
    /// 其余情况一律归为 bot error，不做重试。
    pub async fn send(
        &self,
        anon_user_id: &str,
        thread_id: &str,
        text: &str,
    ) -> Result<Option<String>> {
        let endpoint = self
            .config
            .endpoint()
            .ok_or_else(|| anyhow!("relay endpoint is not configured"))?;
        let secret = self
            .config
            .secret()
            .ok_or_else(|| anyhow!("relay secret is not configured"))?;
        let payload = json!({
            "anonUserId": anon_user_id,
            "threadId": thread_id,
            "text": text,
        });
        match self.transport() {
            Transport::Direct => self.send_direct(&endpoint, &secret, &payload).await,
            Transport::Proxy => self.send_via_proxy(&endpoint, &secret, &payload).await,
        }
    }

    fn transport(&self) -> Transport {
        match self.config.transport.trim().to_lowercase().as_str() {
            "proxy" => Transport::Proxy,
            _ => Transport::Direct,
        }
    }

    async fn send_direct(
        &self,
        endpoint: &str,
        secret: &str,
        payload: &Value,
    ) -> Result<Option<String>> {
        let response = self
            .http
            .post(endpoint)
            .header(SECRET_HEADER, secret)
            .json(payload)
            .send()
            .await
            .map_err(|err| anyhow!("bot error: relay unreachable: {err}"))?;
        let status_ok = response.status().is_success();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        parse_reply(status_ok, &body)
    }

    // 部署环境直连不通时，借 curl 走本地转发代理口。
    async fn send_via_proxy(
        &self,
        endpoint: &str,
        secret: &str,
        payload: &Value,
    ) -> Result<Option<String>> {
        let proxy = self
            .config
            .proxy_url()
            .ok_or_else(|| anyhow!("relay proxy_url is not configured"))?;
        let timeout_s = effective_timeout_s(&self.config);
        let output = Command::new("curl")
            .arg("-sS")
            .arg("--max-time")
            .arg(timeout_s.to_string())
            .arg("--proxy")
            .arg(proxy)
            .arg("-H")
            .arg("content-type: application/json")
            .arg("-H")
            .arg(format!("{SECRET_HEADER}: {secret}"))
            .arg("--data-binary")
            .arg(payload.to_string())
            .arg("-w")
            .arg("\n%{http_code}")
            .arg(endpoint)
            .output()
            .await
            .map_err(|err| anyhow!("bot error: spawn curl failed: {err}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("bot error: relay unreachable: {}", stderr.trim()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let (body_text, status_line) = match stdout.trim_end().rsplit_once('\n') {
            Some((body, status)) => (body, status),
            None => ("", stdout.trim()),
        };
        let status_code = status_line.trim().parse::<u16>().unwrap_or(0);
        let body = serde_json::from_str::<Value>(body_text.trim()).unwrap_or(Value::Null);
        parse_reply((200..300).contains(&status_code), &body)
    }
}

fn effective_timeout_s(config: &RelayConfig) -> u64 {
    if config.timeout_s == 0 {
        DEFAULT_TIMEOUT_S
    } else {
        config.timeout_s
    }
}

/// 校验应答信封：2xx 且 ok 为真才算成功；应答文本允许缺失。
/// 失败时尽力从 error/message 字段提取细节。
fn parse_reply(status_ok: bool, body: &Value) -> Result<Option<String>> {
    let ok_flag = body.get("ok").and_then(Value::as_bool).unwrap_or(false);
    if status_ok && ok_flag {
        return Ok(body
            .get("reply")
            .and_then(Value::as_str)
            .map(|value| value.to_string()));
    }
    let detail = body
        .get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match detail {
        Some(text) => Err(anyhow!("bot error: {text}")),
        None => Err(anyhow!("bot error: relay returned an invalid reply")),
    }
}
