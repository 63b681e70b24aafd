//! The per-dimension handlers and their registration table. The
//! table maps dimension name to a handler value, built once at
//! configuration time; a missing entry for an active dimension is a
//! fatal configuration error, while an exit notification is a no-op
//! by default (the trait's `exit` defaults to doing nothing).

use std::collections::BTreeMap;

use crate::{
    dimension::{ConfigurationError, DimValue, DimensionName},
    point::Point,
};

use super::context::SweepContext;

/// What a handler invocation came to. The driver's continue/abort
/// decision is an inspection of this value: `Recoverable` means "this
/// configuration point failed, keep sweeping", `Fatal` stops the
/// whole run.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("recoverable failure: {0:#}")]
    Recoverable(anyhow::Error),
    #[error("fatal failure: {0:#}")]
    Fatal(anyhow::Error),
}

impl HandlerError {
    pub fn recoverable(e: impl Into<anyhow::Error>) -> Self {
        Self::Recoverable(e.into())
    }

    pub fn fatal(e: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(e.into())
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            Self::Recoverable(e) => e,
            Self::Fatal(e) => e,
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// One dimension's lifecycle callbacks. `enter` runs when the
/// dimension takes a (new) value, `exit` when a value is being left,
/// including the final teardown pass after the last point.
pub trait DimensionHandler {
    fn enter(&mut self, value: &DimValue, point: &Point, cx: &mut SweepContext) -> HandlerResult;

    fn exit(&mut self, _value: &DimValue, _point: &Point, _cx: &mut SweepContext) -> HandlerResult {
        Ok(())
    }
}

type HandlerFn = Box<dyn FnMut(&DimValue, &Point, &mut SweepContext) -> HandlerResult>;

/// Closure-based handler for hosts that do not want a struct per
/// dimension.
pub struct FnHandler {
    enter: HandlerFn,
    exit: Option<HandlerFn>,
}

impl FnHandler {
    pub fn new(
        enter: impl FnMut(&DimValue, &Point, &mut SweepContext) -> HandlerResult + 'static,
    ) -> Self {
        Self {
            enter: Box::new(enter),
            exit: None,
        }
    }

    pub fn with_exit(
        mut self,
        exit: impl FnMut(&DimValue, &Point, &mut SweepContext) -> HandlerResult + 'static,
    ) -> Self {
        self.exit = Some(Box::new(exit));
        self
    }
}

impl DimensionHandler for FnHandler {
    fn enter(&mut self, value: &DimValue, point: &Point, cx: &mut SweepContext) -> HandlerResult {
        (self.enter)(value, point, cx)
    }

    fn exit(&mut self, value: &DimValue, point: &Point, cx: &mut SweepContext) -> HandlerResult {
        match &mut self.exit {
            Some(exit) => exit(value, point, cx),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<DimensionName, Box<dyn DimensionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: DimensionName,
        handler: impl DimensionHandler + 'static,
    ) -> Result<(), ConfigurationError> {
        if self.handlers.contains_key(&name) {
            return Err(ConfigurationError::DuplicateHandler { name });
        }
        self.handlers.insert(name, Box::new(handler));
        Ok(())
    }

    pub(crate) fn get_mut(&mut self, name: &DimensionName) -> Option<&mut Box<dyn DimensionHandler>> {
        self.handlers.get_mut(name)
    }

    /// Every active dimension needs a registered handler before the
    /// sweep may start.
    pub fn check_covers(&self, order: &[DimensionName]) -> Result<(), ConfigurationError> {
        for name in order {
            if !self.handlers.contains_key(name) {
                return Err(ConfigurationError::MissingHandler { name: name.clone() });
            }
        }
        Ok(())
    }
}
