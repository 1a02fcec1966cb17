use crate::dispatch::Dispatcher;
use crate::models::{ActionClass, CommandId, CommandIdError};
use crate::store::StoreError;
use log::{debug, info};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error(transparent)]
    CommandId(#[from] CommandIdError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Typed payload of an inbound completion signal, parsed from the wire
/// command name `verb---domain---nonce`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignal {
    pub target_ref: Uuid,
    pub verb: String,
    pub domain: String,
    pub nonce: String,
}

impl CompletionSignal {
    pub fn parse(target_ref: Uuid, command_name: &str) -> Result<Self, CommandIdError> {
        let (verb, domain, nonce) = CommandId::parse(command_name)?;
        Ok(CompletionSignal {
            target_ref,
            verb,
            domain,
            nonce,
        })
    }
}

type Handler = Box<dyn Fn(&CompletionSignal) + Send + Sync>;

/// Observer registry for completion signals. Register verb handlers at
/// startup; `handle` clears the verb's pending marker through the
/// dispatcher, so the clear happens under the same per-server lock as any
/// concurrent dispatch, and then notifies the handler, if any. Unknown
/// verbs still parse and are logged, so a script repository newer than this
/// binary degrades gracefully.
#[derive(Default)]
pub struct CompletionRouter {
    handlers: HashMap<String, Handler>,
}

impl CompletionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_verb(
        &mut self,
        verb: impl Into<String>,
        handler: impl Fn(&CompletionSignal) + Send + Sync + 'static,
    ) {
        self.handlers.insert(verb.into(), Box::new(handler));
    }

    pub fn handle(
        &self,
        dispatcher: &Dispatcher,
        target_ref: Uuid,
        command_name: &str,
    ) -> Result<CompletionSignal, CompletionError> {
        let signal = CompletionSignal::parse(target_ref, command_name)?;
        info!(
            "completion signal for {}: verb={} domain={}",
            signal.target_ref, signal.verb, signal.domain
        );

        if ActionClass::for_verb(&signal.verb).is_some() {
            dispatcher.acknowledge_completion(&signal.target_ref, &signal.verb)?;
        } else {
            debug!("no action class for verb '{}', nothing to clear", signal.verb);
        }

        if let Some(handler) = self.handlers.get(&signal.verb) {
            handler(&signal);
        }
        Ok(signal)
    }
}
