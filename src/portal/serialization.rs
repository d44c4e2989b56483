use serde::{Deserialize, Deserializer};
use uuid::Uuid;

/// 反序列化时把 null 当作默认值（服务器对空文本列可能返回 null）
pub fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let opt = Option::<T>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// access token（JWT）中用到的声明
#[derive(Debug, Clone, Deserialize)]
pub struct JwtClaims {
    /// 用户 ID
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    /// 过期时间（秒级时间戳）
    #[serde(default)]
    pub exp: Option<i64>,
}

/// 解码 JWT 的 payload 段（不校验签名，签名由服务器负责）
pub fn decode_jwt_claims(token: &str) -> anyhow::Result<JwtClaims> {
    use anyhow::Context;
    use base64::Engine;

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("access token 格式无效"))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("access token payload 不是合法的 base64url")?;
    serde_json::from_slice(&bytes).context("解析 access token 声明失败")
}

/// 生成上传文件的存储路径：`[<prefix>/]<uuid>.<ext>`
///
/// 扩展名取原文件名最后一个 `.` 之后的部分，缺失时不带扩展名。
pub fn object_path(prefix: Option<&str>, file_name: &str) -> String {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    let name = match ext {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext.to_ascii_lowercase()),
        None => Uuid::new_v4().to_string(),
    };
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, name),
        _ => name,
    }
}
