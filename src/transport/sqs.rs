//! Amazon SQS transport.
//!
//! Thin mapping from [`Transport`] onto `aws-sdk-sqs`. Service error codes are
//! folded into the crate error taxonomy so callers never see SDK types.

use super::traits::{QueuePage, RawMessage, ReceiveRequest, SendRequest, Transport, MAX_BATCH_SIZE};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_sdk_sqs::config::Credentials;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, MessageAttributeValue, QueueAttributeName,
};
use aws_sdk_sqs::Client as SqsClient;
use std::collections::HashMap;

const QUEUE_EXISTS_CODES: &[&str] = &["QueueAlreadyExists", "QueueNameExists"];
const QUEUE_MISSING_CODES: &[&str] = &[
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
];

pub struct SqsTransport {
    client: SqsClient,
}

impl SqsTransport {
    pub fn new(client: SqsClient) -> Self {
        Self { client }
    }

    /// Build a client from the `[transport]` section. Static credentials are
    /// used when both keys are configured; otherwise the default AWS provider
    /// chain applies.
    pub async fn connect(config: &TransportConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(endpoint) = config.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            loader = loader.endpoint_url(endpoint);
        }
        match (&config.access_key, &config.secret_key) {
            (Some(access), Some(secret)) => {
                loader = loader.credentials_provider(Credentials::new(
                    access.clone(),
                    secret.clone(),
                    None,
                    None,
                    "replyqueue-config",
                ));
            }
            (None, None) => {}
            _ => {
                return Err(Error::Config(
                    "transport.access_key and transport.secret_key must be set together".into(),
                ))
            }
        }

        let shared = loader.load().await;
        tracing::debug!(region = %config.region, "SQS client configured");
        Ok(Self::new(SqsClient::new(&shared)))
    }
}

fn map_error<E>(err: &E, subject: &str) -> Error
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let code = err.code().unwrap_or_default();
    if QUEUE_EXISTS_CODES.contains(&code) {
        return Error::QueueAlreadyExists {
            name: subject.to_string(),
        };
    }
    if QUEUE_MISSING_CODES.contains(&code) {
        return Error::queue_not_found(subject);
    }
    Error::TransportUnavailable(format!("{}", DisplayErrorContext(err)))
}

fn to_i32(value: impl TryInto<i32>, what: &str) -> Result<i32> {
    value
        .try_into()
        .map_err(|_| Error::InvalidRequest(format!("{what} out of range")))
}

#[async_trait]
impl Transport for SqsTransport {
    fn name(&self) -> &str {
        "sqs"
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
        tags: &HashMap<String, String>,
    ) -> Result<String> {
        let attributes: HashMap<QueueAttributeName, String> = attributes
            .iter()
            .map(|(k, v)| (QueueAttributeName::from(k.as_str()), v.clone()))
            .collect();

        let output = self
            .client
            .create_queue()
            .queue_name(name)
            .set_attributes((!attributes.is_empty()).then_some(attributes))
            .set_tags((!tags.is_empty()).then(|| tags.clone()))
            .send()
            .await
            .map_err(|e| map_error(&e, name))?;

        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| Error::TransportUnavailable("create_queue returned no url".into()))
    }

    async fn get_queue_url(&self, name: &str) -> Result<String> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| map_error(&e, name))?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| Error::queue_not_found(name))
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        self.client
            .delete_queue()
            .queue_url(queue_url)
            .send()
            .await
            .map_err(|e| map_error(&e, queue_url))?;
        Ok(())
    }

    async fn tag_queue(&self, queue_url: &str, tags: &HashMap<String, String>) -> Result<()> {
        self.client
            .tag_queue()
            .queue_url(queue_url)
            .set_tags(Some(tags.clone()))
            .send()
            .await
            .map_err(|e| map_error(&e, queue_url))?;
        Ok(())
    }

    async fn get_queue_tags(&self, queue_url: &str) -> Result<HashMap<String, String>> {
        let output = self
            .client
            .list_queue_tags()
            .queue_url(queue_url)
            .send()
            .await
            .map_err(|e| map_error(&e, queue_url))?;
        Ok(output.tags().cloned().unwrap_or_default())
    }

    async fn list_queues(
        &self,
        prefix: &str,
        max_results: usize,
        page_token: Option<String>,
    ) -> Result<QueuePage> {
        let output = self
            .client
            .list_queues()
            .queue_name_prefix(prefix)
            .max_results(to_i32(max_results.clamp(1, 1000), "max_results")?)
            .set_next_token(page_token)
            .send()
            .await
            .map_err(|e| map_error(&e, prefix))?;

        Ok(QueuePage {
            queue_urls: output.queue_urls().to_vec(),
            next_token: output.next_token().map(str::to_string),
        })
    }

    async fn get_queue_depth(&self, queue_url: &str) -> Result<u64> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| map_error(&e, queue_url))?;

        Ok(output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    async fn send(&self, queue_url: &str, request: SendRequest) -> Result<String> {
        let mut message_attributes = HashMap::with_capacity(request.attributes.len());
        for (key, value) in request.attributes {
            let attr = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|e| Error::InvalidRequest(format!("attribute {key}: {e}")))?;
            message_attributes.insert(key, attr);
        }

        let mut call = self
            .client
            .send_message()
            .queue_url(queue_url)
            .message_body(request.body)
            .set_message_attributes((!message_attributes.is_empty()).then_some(message_attributes))
            .set_message_group_id(request.group_id)
            .set_message_deduplication_id(request.deduplication_id);
        if request.delay_seconds > 0 {
            call = call.delay_seconds(to_i32(request.delay_seconds, "delay_seconds")?);
        }

        let output = call.send().await.map_err(|e| map_error(&e, queue_url))?;
        Ok(output.message_id().unwrap_or_default().to_string())
    }

    async fn receive_batch(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<RawMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(to_i32(request.max_messages, "max_messages")?)
            .set_message_attribute_names(Some(request.attribute_names.clone()))
            .set_visibility_timeout(
                request
                    .visibility_timeout_secs
                    .map(|secs| to_i32(secs, "visibility_timeout"))
                    .transpose()?,
            )
            .wait_time_seconds(to_i32(request.wait_time_secs, "wait_time_seconds")?)
            .send()
            .await
            .map_err(|e| map_error(&e, queue_url))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|m| {
                let receipt_handle = m.receipt_handle()?.to_string();
                let attributes = m
                    .message_attributes()
                    .map(|attrs| {
                        attrs
                            .iter()
                            .filter_map(|(k, v)| {
                                v.string_value().map(|s| (k.clone(), s.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(RawMessage {
                    message_id: m.message_id().unwrap_or_default().to_string(),
                    receipt_handle,
                    body: m.body().unwrap_or_default().to_string(),
                    attributes,
                })
            })
            .collect();
        Ok(messages)
    }

    async fn delete_batch(&self, queue_url: &str, receipt_handles: &[String]) -> Result<()> {
        if receipt_handles.is_empty() {
            return Ok(());
        }
        if receipt_handles.len() > MAX_BATCH_SIZE {
            return Err(Error::InvalidRequest(format!(
                "at most {MAX_BATCH_SIZE} receipt handles per delete call"
            )));
        }

        let entries = receipt_handles
            .iter()
            .enumerate()
            .map(|(i, handle)| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(i.to_string())
                    .receipt_handle(handle)
                    .build()
                    .map_err(|e| Error::InvalidRequest(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .delete_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| map_error(&e, queue_url))?;

        for failure in output.failed() {
            tracing::warn!(
                queue = %queue_url,
                entry = %failure.id(),
                code = %failure.code(),
                "SQS refused to delete message"
            );
        }
        Ok(())
    }
}
