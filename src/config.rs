/// Tuning shared by the renderer, the reconciler and the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
	/// Maximum nesting the renderer and the reconciler descend into. Deeper subtrees are logged and left as they are.
	pub depth_limit: usize,
	/// Whether a pass that reports unresolved skip markers is rendered and applied again without change tracking.
	pub full_render_retry: bool,
	/// How many destroyed fragment ids the session remembers, so their late replies are ignored instead of rejected.
	pub tombstone_limit: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			depth_limit: 1000,
			full_render_retry: true,
			tombstone_limit: 64,
		}
	}
}

impl Config {
	#[must_use]
	pub fn with_depth_limit(self, depth_limit: usize) -> Self {
		Self { depth_limit, ..self }
	}

	#[must_use]
	pub fn with_full_render_retry(self, full_render_retry: bool) -> Self {
		Self {
			full_render_retry,
			..self
		}
	}

	#[must_use]
	pub fn with_tombstone_limit(self, tombstone_limit: usize) -> Self {
		Self { tombstone_limit, ..self }
	}
}
