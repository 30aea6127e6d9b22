use futures::{future::BoxFuture, FutureExt};
use reqwest::{
    multipart::{Form, Part},
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

use crate::{dedup::UploadFile, session_id::SessionId};

use super::{backend::*, errors::AppError};

/// HTTP client for the search API.
pub struct AppRemote {
    remote_addr: String,
    basic_auth: Option<(String, Option<String>)>,
    client: reqwest::Client,
}

impl AppRemote {
    pub fn new(addr: &str, basic_auth: Option<(String, Option<String>)>) -> AppRemote {
        let remote_addr = addr.strip_suffix("/").unwrap_or(addr).to_string();

        AppRemote {
            remote_addr,
            basic_auth,
            client: reqwest::Client::new(),
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        log::info!("GET {}{}", self.remote_addr, url);
        let url = format!("{}{}", self.remote_addr, url);

        match self.basic_auth.clone() {
            Some((username, password)) => self.client.get(&url).basic_auth(username, password),
            None => self.client.get(&url),
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        log::info!("POST {}{}", self.remote_addr, url);
        let url = format!("{}{}", self.remote_addr, url);

        match self.basic_auth.clone() {
            Some((username, password)) => self.client.post(&url).basic_auth(username, password),
            None => self.client.post(&url),
        }
    }
}

fn file_part(file: &UploadFile) -> Result<Part, AppError> {
    let part = Part::bytes(file.bytes.clone()).file_name(file.name.clone());

    match file.mime() {
        Some(mime) => Ok(part.mime_str(mime)?),
        None => Ok(part),
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<Value>,
}

/// Pick the message to show for a failed request.
///
/// The backend reports failures as `{"detail": ...}` where `detail` is either
/// a string or a structured object (validation errors). Objects are shown as
/// JSON. Anything else falls back to the HTTP status text.
pub fn extract_error_message(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|body| body.detail);

    match detail {
        Some(Value::String(message)) => message,
        Some(Value::Null) | None => status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| status.as_str().to_string()),
        Some(structured) => structured.to_string(),
    }
}

async fn handle_response<T>(response: reqwest::Response) -> Result<T, AppError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        let message = extract_error_message(status, &text);
        log::warn!("request failed with {status}: {message}");
        return Err(AppError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    let data = serde_json::from_str::<T>(&text).map_err(|err| {
        log::error!("{err}. tried to parse: {text:?}");
        err
    })?;

    Ok(data)
}

impl SearchBackend for AppRemote {
    fn submit_image_search<'a>(
        &'a self,
        positives: &'a [UploadFile],
        negatives: &'a [UploadFile],
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, Result<Value, AppError>> {
        async move {
            let mut form = Form::new().text("session_id", session_id.to_string());
            for file in positives {
                form = form.part("positives", file_part(file)?);
            }
            for file in negatives {
                form = form.part("negatives", file_part(file)?);
            }

            let resp = self.post("/api/search").multipart(form).send().await?;
            handle_response(resp).await
        }
        .boxed()
    }

    fn submit_text_search<'a>(
        &'a self,
        request: &'a PromptSearchRequest,
    ) -> BoxFuture<'a, Result<Value, AppError>> {
        async move {
            let resp = self.post("/api/search/text").json(request).send().await?;
            handle_response(resp).await
        }
        .boxed()
    }

    fn submit_generate_search<'a>(
        &'a self,
        request: &'a PromptSearchRequest,
    ) -> BoxFuture<'a, Result<Value, AppError>> {
        async move {
            let resp = self
                .post("/api/search/generate")
                .json(request)
                .send()
                .await?;
            handle_response(resp).await
        }
        .boxed()
    }

    fn list_collections(&self) -> BoxFuture<'_, Result<Vec<Collection>, AppError>> {
        async move {
            let resp = self.get("/api/collections").send().await?;
            handle_response(resp).await
        }
        .boxed()
    }

    fn create_collection<'a>(
        &'a self,
        meta: &'a CollectionCreate,
    ) -> BoxFuture<'a, Result<Collection, AppError>> {
        async move {
            let resp = self.post("/api/collections").json(meta).send().await?;
            handle_response(resp).await
        }
        .boxed()
    }

    fn fetch_history(&self) -> BoxFuture<'_, Result<Vec<HistoryEntry>, AppError>> {
        async move {
            let resp = self.get("/api/user/history").send().await?;
            handle_response(resp).await
        }
        .boxed()
    }
}

impl FaceValidator for AppRemote {
    fn validate_face<'a>(
        &'a self,
        file: &'a UploadFile,
    ) -> BoxFuture<'a, Result<FaceValidation, AppError>> {
        async move {
            let form = Form::new().part("file", file_part(file)?);
            let resp = self
                .post("/api/validate/face")
                .multipart(form)
                .send()
                .await?;
            handle_response(resp).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_string() {
        let msg = extract_error_message(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"detail":"Image generation failed: quota"}"#,
        );
        assert_eq!(msg, "Image generation failed: quota");
    }

    #[test]
    fn test_detail_structured_is_stringified() {
        let msg = extract_error_message(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"detail":[{"loc":["body","prompt"],"msg":"field required"}]}"#,
        );
        assert!(msg.contains("field required"));
        assert!(msg.starts_with('['));
    }

    #[test]
    fn test_falls_back_to_status_text() {
        assert_eq!(
            extract_error_message(StatusCode::BAD_GATEWAY, "<html>oops</html>"),
            "Bad Gateway"
        );
        assert_eq!(
            extract_error_message(StatusCode::NOT_FOUND, r#"{"detail":null}"#),
            "Not Found"
        );
        assert_eq!(
            extract_error_message(StatusCode::INTERNAL_SERVER_ERROR, ""),
            "Internal Server Error"
        );
    }

    #[test]
    fn test_strips_trailing_slash() {
        let remote = AppRemote::new("http://localhost:8000/", None);
        assert_eq!(remote.remote_addr(), "http://localhost:8000");
    }
}
