use std::collections::HashMap;

use crate::{Error, Result, Serializable, TypeTag};

/// Ordered, deduplicated set of root objects serialized together, with the
/// identity of each.
///
/// Objects are borrowed, so must outlive the collection. Identities are only
/// stable across passes if supplied explicitly with
/// [`Collection::add_with_id`].
///
/// Identity 0 is never assigned. It stands for a null pointer in output.
#[derive(Default)]
pub struct Collection<'a> {
	/// Removed objects leave a `None` until `compact`
	objects: Vec<Option<(u64, &'a dyn Serializable)>>,
	/// Object address -> index in `objects`
	by_addr: HashMap<usize, usize>,
	/// Identity -> index in `objects`
	by_id: HashMap<u64, usize>,
	len: usize,
	next_id: u64,
}

impl<'a> Collection<'a> {
	pub fn new() -> Self {
		Self {
			objects: Vec::new(),
			by_addr: HashMap::new(),
			by_id: HashMap::new(),
			len: 0,
			next_id: 1,
		}
	}

	/// Add object, and return its identity.
	///
	/// If object is already in the collection, returns its existing identity.
	pub fn add(&mut self, object: &'a dyn Serializable) -> u64 {
		if let Some(id) = self.id_of(object) {
			return id;
		}

		let mut id = self.next_id.max(1);
		while self.by_id.contains_key(&id) {
			id += 1;
		}
		self.insert(id, object);
		id
	}

	/// Add object with an explicit identity.
	///
	/// Fails if object is already present with a different identity, or if
	/// `id` is 0 or taken by another object.
	pub fn add_with_id(&mut self, object: &'a dyn Serializable, id: u64) -> Result<()> {
		if id == 0 {
			return Err(Error::InvalidArgument("identity 0 is reserved".into()));
		}
		match self.id_of(object) {
			Some(existing) if existing == id => return Ok(()),
			Some(existing) => {
				return Err(Error::InvalidArgument(format!(
					"object already in collection with identity {existing}"
				)))
			}
			None => {}
		}
		if self.by_id.contains_key(&id) {
			return Err(Error::InvalidArgument(format!("identity {id} already in use")));
		}
		self.insert(id, object);
		Ok(())
	}

	/// Add object known not to be present, with an identity known not to be
	/// in use.
	#[inline]
	pub(crate) fn insert_loaded(&mut self, id: u64, object: &'a dyn Serializable) {
		debug_assert!(!self.contains(object) && !self.by_id.contains_key(&id));
		self.insert(id, object);
	}

	fn insert(&mut self, id: u64, object: &'a dyn Serializable) {
		let index = self.objects.len();
		self.objects.push(Some((id, object)));
		self.len += 1;
		self.by_addr.insert(object.addr(), index);
		self.by_id.insert(id, index);
		self.next_id = self.next_id.max(id + 1);
	}

	/// Remove object. Returns `true` if it was present.
	///
	/// Order of remaining objects is preserved.
	pub fn remove(&mut self, object: &dyn Serializable) -> bool {
		let Some(index) = self.by_addr.remove(&object.addr()) else {
			return false;
		};
		if let Some((id, _)) = self.objects[index].take() {
			self.by_id.remove(&id);
		}
		self.len -= 1;
		if self.objects.len() > 2 * self.len + 16 {
			self.compact();
		}
		true
	}

	/// Drop slots of removed objects, and re-index the rest.
	fn compact(&mut self) {
		self.objects.retain(Option::is_some);
		for (index, &(id, object)) in self.objects.iter().flatten().enumerate() {
			self.by_addr.insert(object.addr(), index);
			self.by_id.insert(id, index);
		}
	}

	#[inline]
	pub fn contains(&self, object: &dyn Serializable) -> bool {
		self.by_addr.contains_key(&object.addr())
	}

	/// Objects which are of kind `tag`, in collection order.
	pub fn objects_of_type(&self, tag: TypeTag) -> Vec<&'a dyn Serializable> {
		self
			.objects
			.iter()
			.flatten()
			.filter(|(_, object)| object.is_kind(tag))
			.map(|&(_, object)| object)
			.collect()
	}

	pub fn id_of(&self, object: &dyn Serializable) -> Option<u64> {
		let &index = self.by_addr.get(&object.addr())?;
		self.objects[index].map(|(id, _)| id)
	}

	pub fn get(&self, id: u64) -> Option<&'a dyn Serializable> {
		let &index = self.by_id.get(&id)?;
		self.objects[index].map(|(_, object)| object)
	}

	/// Iterate over `(identity, object)` pairs, in collection order.
	pub fn iter(&self) -> impl Iterator<Item = (u64, &'a dyn Serializable)> + '_ {
		self.objects.iter().flatten().copied()
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.len
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Highest identity in use, or 0 if empty.
	pub fn max_id(&self) -> u64 {
		self.objects.iter().flatten().map(|&(id, _)| id).max().unwrap_or(0)
	}
}

#[cfg(test)]
mod tests {
	use std::any::Any;

	use super::*;
	use crate::ObjectHeader;

	struct Item {
		header: ObjectHeader,
		_value: u32,
	}

	impl Item {
		fn new(tag: TypeTag) -> Self {
			Self {
				header: ObjectHeader::new(tag),
				_value: 0,
			}
		}
	}

	impl Serializable for Item {
		fn header(&self) -> &ObjectHeader {
			&self.header
		}

		fn header_mut(&mut self) -> &mut ObjectHeader {
			&mut self.header
		}

		fn as_any(&self) -> &dyn Any {
			self
		}

		fn as_any_mut(&mut self) -> &mut dyn Any {
			self
		}
	}

	fn addr(item: &Item) -> usize {
		(item as &dyn Serializable).addr()
	}

	const A: TypeTag = TypeTag::user(1);
	const B: TypeTag = TypeTag::user(2);

	#[test]
	fn add_is_idempotent() {
		let (x, y) = (Item::new(A), Item::new(A));
		let mut collection = Collection::new();
		let id_x = collection.add(&x);
		let id_y = collection.add(&y);
		assert_ne!(id_x, id_y);
		assert_eq!(collection.add(&x), id_x);
		assert_eq!(collection.len(), 2);
		assert_eq!(collection.id_of(&y), Some(id_y));
		assert!(collection.get(id_x).is_some_and(|o| o.addr() == addr(&x)));
	}

	#[test]
	fn insertion_order_preserved() {
		let items: Vec<Item> = (0..5).map(|_| Item::new(A)).collect();
		let mut collection = Collection::new();
		for item in items.iter().rev() {
			collection.add(item);
		}
		let addrs: Vec<usize> = collection.iter().map(|(_, o)| o.addr()).collect();
		let expected: Vec<usize> = items.iter().rev().map(addr).collect();
		assert_eq!(addrs, expected);
	}

	#[test]
	fn remove() {
		let (x, y, z) = (Item::new(A), Item::new(A), Item::new(A));
		let mut collection = Collection::new();
		collection.add(&x);
		let id_y = collection.add(&y);
		let id_z = collection.add(&z);
		assert!(collection.remove(&x));
		assert!(!collection.remove(&x));
		assert!(!collection.contains(&x));
		assert!(collection.contains(&y));
		assert_eq!(collection.id_of(&z), Some(id_z));
		assert!(collection.get(id_y).is_some_and(|o| o.addr() == addr(&y)));
		assert_eq!(collection.len(), 2);
	}

	#[test]
	fn remove_many_keeps_order() {
		let items: Vec<Item> = (0..100).map(|_| Item::new(A)).collect();
		let mut collection = Collection::new();
		let ids: Vec<u64> = items.iter().map(|item| collection.add(item)).collect();

		// Enough removals to compact several times
		for item in items.iter().step_by(3) {
			assert!(collection.remove(item));
		}
		for item in items.iter().skip(1).step_by(3) {
			assert!(collection.remove(item));
		}

		let kept: Vec<usize> = (2..100).step_by(3).collect();
		assert_eq!(collection.len(), kept.len());
		let addrs: Vec<usize> = collection.iter().map(|(_, o)| o.addr()).collect();
		let expected: Vec<usize> = kept.iter().map(|&i| addr(&items[i])).collect();
		assert_eq!(addrs, expected);
		for &i in &kept {
			assert_eq!(collection.id_of(&items[i]), Some(ids[i]));
			assert!(collection.get(ids[i]).is_some_and(|o| o.addr() == addr(&items[i])));
		}
		assert!(collection.get(ids[0]).is_none());
		assert_eq!(collection.max_id(), ids[98]);

		// Re-adding goes to the end
		collection.add(&items[0]);
		assert_eq!(collection.iter().last().map(|(_, o)| o.addr()), Some(addr(&items[0])));
	}

	#[test]
	fn explicit_ids() {
		let (x, y, z) = (Item::new(A), Item::new(A), Item::new(A));
		let mut collection = Collection::new();
		collection.add_with_id(&x, 10).unwrap();
		assert!(collection.add_with_id(&y, 10).is_err());
		assert!(collection.add_with_id(&y, 0).is_err());
		assert!(collection.add_with_id(&x, 11).is_err());
		collection.add_with_id(&x, 10).unwrap();
		assert_eq!(collection.add(&z), 11);
		assert_eq!(collection.max_id(), 11);
	}

	#[test]
	fn objects_of_type() {
		let (x, y, z) = (Item::new(A), Item::new(B), Item::new(A));
		let mut collection = Collection::new();
		collection.add(&x);
		collection.add(&y);
		collection.add(&z);
		assert_eq!(collection.objects_of_type(A).len(), 2);
		assert_eq!(collection.objects_of_type(B).len(), 1);
		assert!(collection.objects_of_type(TypeTag::user(3)).is_empty());
	}
}
