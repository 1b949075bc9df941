#![doc(html_root_url = "https://docs.rs/live-fragment/0.0.1")]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[cfg(doctest)]
pub mod readme {
	doc_comment::doctest!("../README.md");
}

pub mod config;
pub mod dom;
#[cfg(feature = "web")]
pub mod load;
pub mod markup;
pub mod rc_hash_map;
pub mod reconcile;
pub mod ref_ledger;
pub mod rendered;
pub mod session;
pub mod wire;

pub use config::Config;
pub use dom::{Document, NodeId};
pub use reconcile::{PatchReport, Reconciler};
pub use ref_ledger::{Ref, RefLedger, RefOptions};
pub use rendered::{DiffTree, Rendering};
pub use session::{FragmentId, JoinState, Notification, Session, SessionError, Transport};
pub use wire::{DecodeError, DiffPayload, OutboundEvent, Reply};

/// Stable identity of a structurally stable subtree, the reconciler's join key.
pub const MAGIC_ID: &str = "data-magic";
/// Marks an unchanged root whose content was omitted from the markup.
pub const SKIP: &str = "data-skip";
/// Marks the template emitted in place of a missing or malformed subtree.
pub const PLACEHOLDER: &str = "data-placeholder";

pub const REF_LOADING: &str = "data-ref-loading";
pub const REF_LOCK: &str = "data-ref-lock";
/// The fragment whose ledger issued the refs on this element.
pub const REF_SRC: &str = "data-ref-src";
/// The `disabled` state (`"true"` or `"false"`) to restore once loading is released.
pub const REF_DISABLED: &str = "data-ref-disabled";

/// Container of a nested fragment; the value is the fragment id.
pub const FRAGMENT: &str = "data-fragment";
/// `"stream"` or `"ignore"`.
pub const UPDATE: &str = "data-update";
pub const STREAM_REF: &str = "data-stream-ref";
/// Name of the lifecycle hook attached to an element.
pub const HOOK: &str = "data-hook";

/// Ref bookkeeping attributes, which the reconciler always keeps from the live element.
pub const REF_ATTRIBUTES: [&str; 4] = [REF_LOADING, REF_LOCK, REF_SRC, REF_DISABLED];
