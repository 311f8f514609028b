use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct DownloadResponse {
    pub data: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}
