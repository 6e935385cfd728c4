use super::CallRecord;
use crate::config::SummaryConfig;
use anyhow::Result;
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use dotenv::dotenv;

const DEFAULT_PROMPT: &str = "Summarize this phone call in two or three sentences. \
State what the caller wanted and how the call ended.";

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, record: &CallRecord) -> Result<String>;
}

pub struct OpenAiSummarizer {
    client: Client<OpenAIConfig>,
    model: String,
    prompt: String,
}

impl OpenAiSummarizer {
    pub fn new(config: &SummaryConfig) -> Result<Self> {
        let _ = dotenv();
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| anyhow::anyhow!("API key is required"))?;
        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = config
            .base_url
            .clone()
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
        {
            openai_config = openai_config.with_api_base(base_url);
        }
        Ok(Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            prompt: config
                .prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
        })
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, record: &CallRecord) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(self.prompt.as_str())
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(record.transcript_text())
                    .build()?
                    .into(),
            ])
            .build()?;
        let response = self.client.chat().create(request).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("empty summary response"))
    }
}
