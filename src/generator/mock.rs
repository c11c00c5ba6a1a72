//! Scripted generator for tests and offline runs.
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;

use super::{ChatMessage, Generator, TokenStream};
use crate::error::{Error, Result, ServiceError};

/// One recorded request.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
enum Behaviour {
    Answer,
    Fail(ServiceError),
    /// Stream the given number of fragments, then fail.
    FailAfter(usize, ServiceError),
}

/// Replies with a fixed answer, split on spaces when streamed.
pub struct MockGenerator {
    answer: String,
    behaviour: Behaviour,
    calls: AtomicUsize,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl MockGenerator {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            behaviour: Behaviour::Answer,
            calls: AtomicUsize::new(0),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails before producing anything.
    pub fn failing(failure: ServiceError) -> Self {
        Self {
            behaviour: Behaviour::Fail(failure),
            ..Self::new("")
        }
    }

    /// Streams `fragments` fragments of `answer`, then a failure.
    pub fn failing_mid_stream(
        answer: impl Into<String>,
        fragments: usize,
        failure: ServiceError,
    ) -> Self {
        Self {
            behaviour: Behaviour::FailAfter(fragments, failure),
            ..Self::new(answer)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests seen so far, oldest first.
    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn record(&self, system_prompt: &str, messages: &[ChatMessage]) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push(RecordedCall {
                system_prompt: system_prompt.to_string(),
                messages: messages.to_vec(),
            });
        }
    }

    fn fragments(&self) -> Vec<String> {
        self.answer
            .split_inclusive(' ')
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, system_prompt: &str, messages: &[ChatMessage]) -> Result<String> {
        self.record(system_prompt, messages);
        match &self.behaviour {
            Behaviour::Fail(e) | Behaviour::FailAfter(_, e) => Err(Error::Generation(e.clone())),
            Behaviour::Answer => Ok(self.answer.clone()),
        }
    }

    async fn generate_stream(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<TokenStream> {
        self.record(system_prompt, messages);
        let items: Vec<Result<String>> = match &self.behaviour {
            Behaviour::Fail(e) => return Err(Error::Generation(e.clone())),
            Behaviour::Answer => self.fragments().into_iter().map(Ok).collect(),
            Behaviour::FailAfter(n, e) => self
                .fragments()
                .into_iter()
                .take(*n)
                .map(Ok)
                .chain(std::iter::once(Err(Error::Generation(e.clone()))))
                .collect(),
        };
        Ok(futures::stream::iter(items).boxed())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}
