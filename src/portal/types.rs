use serde::Deserialize;
use serde_json::Value;

/// 托管后端统一的错误响应体
///
/// 表接口返回 `{code, message, details, hint}`，认证接口返回
/// `{error, error_description}` 或 `{msg}`，这里全部兼容。
#[derive(Debug, Default, Deserialize)]
pub struct RestErrorBody {
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl RestErrorBody {
    /// 提取最有用的一条错误描述
    pub fn describe(&self) -> Option<String> {
        let text = self
            .message
            .clone()
            .or_else(|| self.error_description.clone())
            .or_else(|| self.msg.clone())
            .or_else(|| self.error.clone())?;
        match (&self.details, &self.hint) {
            (Some(details), _) if !details.is_empty() => Some(format!("{} ({})", text, details)),
            (_, Some(hint)) if !hint.is_empty() => Some(format!("{} (提示: {})", text, hint)),
            _ => Some(text),
        }
    }
}

/// 通用 HTTP 响应处理：检查状态码，解析错误体，成功时返回 JSON
///
/// 空 body（204）返回 `Value::Null`。所有 REST 调用共用此方法。
pub async fn handle_http_response(
    response: reqwest::Response,
    operation_name: &str,
) -> anyhow::Result<Value> {
    use anyhow::Context;
    use tracing::{debug, error};

    let status = response.status();

    // 读取 body bytes（只能读取一次）
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        let reason = serde_json::from_slice::<RestErrorBody>(&body_bytes)
            .ok()
            .and_then(|b| b.describe())
            .unwrap_or_else(|| body_str.to_string());
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 原因: {}",
            operation_name, status, reason
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, reason));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    if body_bytes.is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_slice::<Value>(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })
}
