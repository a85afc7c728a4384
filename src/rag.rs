//! Retrieval-augmented answering.
//!
//! [`RagPipeline::answer`] and [`RagPipeline::answer_stream`] share the same
//! retrieval step:
//!
//! 1. Reject an empty query or a scope naming an unknown document.
//! 2. Empty index: answer with [`EMPTY_KB_ANSWER`], no embedding or completion call.
//! 3. Search; keep only the scoped document's passages when scoped.
//! 4. Nothing left: answer with [`NO_RESULTS_ANSWER`].
//! 5. Build a grounded prompt from the passages in rank order and call the
//!    completion provider.
//!
//! Provider and index failures never reach the caller; they are logged and
//! the answer becomes [`APOLOGY_ANSWER`] with no sources. Only caller input
//! errors are returned as `Err`.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::completion::{ChatMessage, CompletionProvider};
use crate::error::{RagError, Result};
use crate::knowledge_base::KnowledgeBase;
use crate::models::{Answer, Passage, StreamEvent};

pub const EMPTY_KB_ANSWER: &str =
    "The knowledge base is empty. Please upload documents before asking questions.";
pub const NO_RESULTS_ANSWER: &str =
    "Sorry, no information relevant to your question was found in the uploaded documents.";
pub const APOLOGY_ANSWER: &str =
    "Sorry, something went wrong while generating the answer. Please try again later.";

const SYSTEM_PROMPT: &str = "You are a question-answering assistant for documents the user has \
uploaded. Answer only from the document content provided. If the documents do not contain the \
answer, say so plainly instead of guessing.";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";
const STREAM_BUFFER: usize = 64;

enum Retrieval {
    /// A fixed reply that needs no generation.
    Fixed(&'static str),
    Passages(Vec<Passage>),
}

/// Answers questions against a [`KnowledgeBase`].
#[derive(Clone)]
pub struct RagPipeline {
    kb: Arc<KnowledgeBase>,
    llm: Arc<dyn CompletionProvider>,
}

impl RagPipeline {
    pub fn new(kb: Arc<KnowledgeBase>, llm: Arc<dyn CompletionProvider>) -> Self {
        Self { kb, llm }
    }

    /// Answer `query` from the `k` nearest passages, optionally restricted
    /// to one document.
    pub async fn answer(&self, query: &str, k: usize, scope: Option<&str>) -> Result<Answer> {
        let passages = match self.retrieve(query, k, scope).await? {
            Retrieval::Fixed(reply) => return Ok(Answer::without_sources(reply)),
            Retrieval::Passages(passages) => passages,
        };

        let messages = build_messages(query, &passages);
        match self.llm.complete(&messages).await {
            Ok(answer) => {
                info!(passages = passages.len(), "answer generated");
                Ok(Answer {
                    answer,
                    sources: cited_sources(&passages),
                    passages,
                })
            }
            Err(e) => {
                let e = RagError::CompletionProvider(format!("{:#}", e));
                error!(error = %e, "answer generation failed");
                Ok(Answer::without_sources(APOLOGY_ANSWER))
            }
        }
    }

    /// Streaming variant of [`answer`](Self::answer).
    ///
    /// Input errors are returned before anything is streamed. Otherwise the
    /// receiver yields `Token`s, then `Sources`, then `Done`. If generation
    /// fails part-way, it yields `Error` with the apology text, an empty
    /// `Sources`, and `Done`. Fixed replies arrive as a single `Token`.
    pub async fn answer_stream(
        &self,
        query: &str,
        k: usize,
        scope: Option<&str>,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let retrieval = self.retrieve(query, k, scope).await?;
        let (events, rx) = mpsc::channel(STREAM_BUFFER);

        let passages = match retrieval {
            Retrieval::Fixed(reply) => {
                tokio::spawn(async move {
                    for event in [
                        StreamEvent::Token(reply.to_string()),
                        StreamEvent::Sources(Vec::new()),
                        StreamEvent::Done,
                    ] {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                });
                return Ok(rx);
            }
            Retrieval::Passages(passages) => passages,
        };

        let messages = build_messages(query, &passages);
        let sources = cited_sources(&passages);
        let llm = self.llm.clone();

        tokio::spawn(async move {
            let (tokens_tx, mut tokens_rx) = mpsc::channel(STREAM_BUFFER);
            let generation =
                tokio::spawn(async move { llm.complete_stream(&messages, tokens_tx).await });

            let mut emitted = 0usize;
            while let Some(token) = tokens_rx.recv().await {
                emitted += 1;
                if events.send(StreamEvent::Token(token)).await.is_err() {
                    debug!("stream receiver dropped");
                    return;
                }
            }

            let outcome = match generation.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(e) => Err(e.to_string()),
            };

            let tail = match outcome {
                Ok(()) => {
                    info!(tokens = emitted, "streamed answer complete");
                    vec![StreamEvent::Sources(sources), StreamEvent::Done]
                }
                Err(reason) => {
                    let e = RagError::CompletionProvider(reason);
                    error!(error = %e, tokens = emitted, "streamed answer failed");
                    vec![
                        StreamEvent::Error(APOLOGY_ANSWER.to_string()),
                        StreamEvent::Sources(Vec::new()),
                        StreamEvent::Done,
                    ]
                }
            };
            for event in tail {
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn retrieve(&self, query: &str, k: usize, scope: Option<&str>) -> Result<Retrieval> {
        if query.trim().is_empty() {
            return Err(RagError::EmptyQuery);
        }
        if let Some(id) = scope {
            if !self.kb.status().contains(id) {
                return Err(RagError::UnknownDocument(id.to_string()));
            }
        }

        let store = match self.kb.index().await {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "knowledge base unavailable for query");
                return Ok(Retrieval::Fixed(APOLOGY_ANSWER));
            }
        };

        let size = store.size().await;
        if size == 0 {
            return Ok(Retrieval::Fixed(EMPTY_KB_ANSWER));
        }

        // Scoped questions rank over the whole index so the scoped
        // document still gets up to k passages.
        let fetch = if scope.is_some() { size } else { k };
        let hits = match store.search(query, fetch).await {
            Ok(hits) => hits,
            Err(e) => {
                error!(error = %e, "search failed");
                return Ok(Retrieval::Fixed(APOLOGY_ANSWER));
            }
        };

        let passages: Vec<Passage> = hits
            .into_iter()
            .filter(|(segment, _)| scope.map_or(true, |id| segment.source_id == id))
            .take(k)
            .map(|(segment, distance)| Passage {
                source_id: segment.source_id,
                text: segment.text,
                position: segment.position,
                distance,
            })
            .collect();

        debug!(k, scoped = scope.is_some(), found = passages.len(), "retrieved passages");
        if passages.is_empty() {
            return Ok(Retrieval::Fixed(NO_RESULTS_ANSWER));
        }
        Ok(Retrieval::Passages(passages))
    }
}

/// System instruction plus a user message holding the context and question.
pub fn build_messages(query: &str, passages: &[Passage]) -> Vec<ChatMessage> {
    let context = passages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR);

    let prompt = format!(
        "Answer the user's question using the context below.\n\
         If the context does not contain enough information to answer, say clearly that \
         no answer was found in the context. Do not make anything up.\n\n\
         Context:\n{}\n\n\
         Question: {}\n\n\
         Answer:",
        context, query
    );

    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)]
}

/// Source ids in first-seen rank order, without repeats.
pub fn cited_sources(passages: &[Passage]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for passage in passages {
        if !sources.contains(&passage.source_id) {
            sources.push(passage.source_id.clone());
        }
    }
    sources
}
