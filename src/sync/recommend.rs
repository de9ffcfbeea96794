//! Independently loading slot for derived remote data.
//!
//! The recommendation is decoupled from the core journey fields: it loads and
//! errors on its own, and a failure here never touches journey state. Results
//! arrive over a channel and are folded in by [`DerivedSlot::poll`], called
//! from the host's tick.

use color_eyre::Result;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// The state of a derived-data slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotState<T> {
  /// No fetch started yet
  Idle,
  /// A fetch is in flight
  Loading,
  /// The last fetch succeeded
  Ready(T),
  /// The last fetch failed
  Failed(String),
}

impl<T> SlotState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, SlotState::Loading)
  }

  pub fn value(&self) -> Option<&T> {
    match self {
      SlotState::Ready(value) => Some(value),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      SlotState::Failed(e) => Some(e),
      _ => None,
    }
  }
}

/// A slot holding asynchronously fetched data with its own loading and error
/// state.
pub struct DerivedSlot<T> {
  state: Mutex<SlotState<T>>,
  receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<T, String>>>>,
}

impl<T: Clone + Send + 'static> DerivedSlot<T> {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(SlotState::Idle),
      receiver: Mutex::new(None),
    }
  }

  /// Current state, cloned out.
  pub fn state(&self) -> SlotState<T> {
    self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Start a fetch, replacing any pending one. The previous fetch's result
  /// is discarded when it lands.
  pub fn begin(&self, future: impl Future<Output = Result<T>> + Send + 'static) {
    let (tx, rx) = mpsc::unbounded_channel();
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SlotState::Loading;
    *self.receiver.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);

    tokio::spawn(async move {
      let result = future.await.map_err(|e| e.to_string());
      // Ignore send errors - a newer fetch may have replaced the receiver
      let _ = tx.send(result);
    });
  }

  /// Fold in a pending result, if one arrived. Returns `true` when the
  /// state changed.
  pub fn poll(&self) -> bool {
    let mut receiver = self.receiver.lock().unwrap_or_else(|e| e.into_inner());
    let Some(rx) = receiver.as_mut() else {
      return false;
    };

    match rx.try_recv() {
      Ok(Ok(value)) => {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SlotState::Ready(value);
        *receiver = None;
        true
      }
      Ok(Err(error)) => {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SlotState::Failed(error);
        *receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) =
          SlotState::Failed("fetch was cancelled".to_string());
        *receiver = None;
        true
      }
    }
  }
}

impl<T: Clone + Send + 'static> Default for DerivedSlot<T> {
  fn default() -> Self {
    Self::new()
  }
}
