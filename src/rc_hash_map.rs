//! A map of reference counts whose zero-count entries are drained in bulk.

use core::{
	borrow::Borrow,
	hash::{BuildHasher, Hash},
};
use hashbrown::{
	hash_map::{DefaultHashBuilder, Entry, ExtractIf},
	HashMap,
};
use num_traits::{CheckedAdd, CheckedSub, One, Zero};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct RcHashMap<K, C, S = DefaultHashBuilder>(HashMap<K, C, S>)
where
	K: Hash + Eq,
	C: CheckedAdd + CheckedSub + One + Zero,
	S: BuildHasher;
impl<K, C, S> Default for RcHashMap<K, C, S>
where
	K: Hash + Eq,
	C: CheckedAdd + CheckedSub + One + Zero,
	S: Default + BuildHasher,
{
	fn default() -> Self {
		Self::new()
	}
}
impl<K, C, S> RcHashMap<K, C, S>
where
	K: Hash + Eq,
	C: CheckedAdd + CheckedSub + One + Zero,
	S: BuildHasher,
{
	#[must_use]
	pub fn new() -> Self
	where
		S: Default,
	{
		Self(HashMap::with_hasher(S::default()))
	}

	/// Adds one holder of `k`, inserting it with a count of one if absent.
	///
	/// # Errors
	///
	/// Iff the count would overflow `C`.
	pub fn increment(&mut self, k: K) -> Result<&C, CountSaturatedError> {
		match self.0.entry(k) {
			Entry::Occupied(occupied) => {
				let c = occupied.into_mut();
				*c = c.checked_add(&C::one()).ok_or(CountSaturatedError)?;
				Ok(c)
			}
			Entry::Vacant(vacant) => Ok(vacant.insert(C::one())),
		}
	}

	/// Removes one holder of `k`. The entry stays until [`drain_weak`](`RcHashMap::drain_weak`).
	///
	/// Returns [`None`] iff `k` isn't tracked.
	///
	/// # Errors
	///
	/// Iff the count is already zero.
	pub fn weak_decrement<Q: ?Sized>(&mut self, k: &Q) -> Result<Option<&C>, CountSaturatedError>
	where
		K: Borrow<Q>,
		Q: Eq + Hash,
	{
		match self.0.get_mut(k) {
			Some(c) => {
				*c = c.checked_sub(&C::one()).ok_or(CountSaturatedError)?;
				Ok(Some(c))
			}
			None => Ok(None),
		}
	}

	#[must_use]
	pub fn count<Q: ?Sized>(&self, k: &Q) -> Option<&C>
	where
		K: Borrow<Q>,
		Q: Eq + Hash,
	{
		self.0.get(k)
	}

	#[must_use]
	pub fn contains<Q: ?Sized>(&self, k: &Q) -> bool
	where
		K: Borrow<Q>,
		Q: Eq + Hash,
	{
		self.0.contains_key(k)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn keys(&self) -> impl Iterator<Item = &K> {
		self.0.keys()
	}

	/// Iterates over and removes all entries whose count is zero.
	pub fn drain_weak(&mut self) -> DrainWeak<'_, K, C> {
		DrainWeak(self.0.extract_if(DrainWeak::<K, C>::weak_filter as fn(&K, &mut C) -> bool))
	}

	pub fn clear(&mut self) {
		self.0.clear();
	}
}

pub struct DrainWeak<'a, K, C>(ExtractIf<'a, K, C, fn(&K, &mut C) -> bool>);
impl<'a, K, C> DrainWeak<'a, K, C>
where
	C: Zero,
{
	fn weak_filter(_: &K, c: &mut C) -> bool {
		c.is_zero()
	}
}
impl<'a, K, C> Iterator for DrainWeak<'a, K, C> {
	type Item = K;

	fn next(&mut self) -> Option<Self::Item> {
		self.0.next().map(|(k, _)| k)
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		self.0.size_hint()
	}
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("reference count saturated")]
pub struct CountSaturatedError;
