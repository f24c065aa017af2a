use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use serde_json::Value;

use super::openai::types::{GeneralOpenAIRequest, MessageContent};
use super::openai::{dispatch_response, mode_path, passthrough_body};
use super::{Adaptor, CanonicalRequest, Usage, header_value};
use crate::error::RelayError;
use crate::relay::{ClientSink, RelayInfo};

// 轻量适配：
// - 去除 data:image/...;base64, 前缀，只保留逗号后的纯 base64 数据
// - 若 top_p >= 1，压至 0.99，避免部分上游拒绝等边界
pub fn adapt_request_for_zhipu(mut req: GeneralOpenAIRequest) -> GeneralOpenAIRequest {
    if let Some(tp) = req.top_p
        && tp >= 1.0
    {
        req.top_p = Some(0.99);
    }

    for msg in &mut req.messages {
        let Some(MessageContent::Parts(parts)) = &mut msg.content else {
            continue;
        };
        for part in parts.iter_mut() {
            if let Some(img) = &mut part.image_url
                && img.url.starts_with("data:image/")
                && let Some(idx) = img.url.find(',')
            {
                img.url = img.url[idx + 1..].to_string();
            }
        }
    }

    req
}

pub struct ZhipuAdaptor;

#[async_trait]
impl Adaptor for ZhipuAdaptor {
    fn channel_name(&self) -> &'static str {
        "zhipu"
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        Ok(format!(
            "{}/api/paas/v4/{}",
            info.base_url.trim_end_matches('/'),
            mode_path(info.relay_mode)?
        ))
    }

    fn convert_request(
        &self,
        info: &mut RelayInfo,
        request: &CanonicalRequest,
    ) -> Result<Value, RelayError> {
        match request {
            CanonicalRequest::Chat(req) => {
                let adapted = CanonicalRequest::Chat(adapt_request_for_zhipu(req.clone()));
                passthrough_body(info, &adapted)
            }
            other => passthrough_body(info, other),
        }
    }

    fn setup_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<(), RelayError> {
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", info.api_key))?);
        Ok(())
    }

    async fn do_response(
        &self,
        info: &mut RelayInfo,
        response: reqwest::Response,
        sink: &mut dyn ClientSink,
    ) -> Result<Usage, RelayError> {
        dispatch_response(info, response, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::openai::types::{ContentPart, ImageUrl, Message};

    #[test]
    fn clamps_top_p_and_strips_data_url_prefix() {
        let req = GeneralOpenAIRequest {
            model: "glm-4v".into(),
            top_p: Some(1.0),
            messages: vec![Message {
                role: "user".into(),
                content: Some(MessageContent::Parts(vec![
                    ContentPart::text("describe"),
                    ContentPart {
                        kind: "image_url".into(),
                        text: None,
                        image_url: Some(ImageUrl {
                            url: "data:image/png;base64,AAAA".into(),
                            detail: None,
                        }),
                    },
                ])),
                ..Default::default()
            }],
            ..Default::default()
        };
        let out = adapt_request_for_zhipu(req);
        assert_eq!(out.top_p, Some(0.99));
        let Some(MessageContent::Parts(parts)) = &out.messages[0].content else {
            panic!("parts expected");
        };
        assert_eq!(parts[1].image_url.as_ref().unwrap().url, "AAAA");
    }

    #[test]
    fn keeps_top_p_below_one() {
        let req = GeneralOpenAIRequest {
            top_p: Some(0.5),
            ..Default::default()
        };
        assert_eq!(adapt_request_for_zhipu(req).top_p, Some(0.5));
    }
}
