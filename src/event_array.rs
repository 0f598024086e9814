use super::*;

/// Growth policy of an [`EventArray`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ArrayCapacity {
  /// Storage is allocated once up front and never grows.
  Fixed(usize),
  /// Storage grows on demand; growth failures are reported, not aborted on.
  Growable,
}

/// Homogeneous record storage shared by recorders, staging and the snapshot.
///
/// Every allocation goes through `try_reserve` so that running out of memory
/// while tracking surfaces as [`ArrayError::OutOfMemory`] instead of aborting
/// the host process.
#[derive(Debug, Clone)]
pub struct EventArray<T> {
  capacity: ArrayCapacity,
  items: Vec<T>,
}

impl<T> Default for EventArray<T> {
  fn default() -> Self {
    Self::growable()
  }
}

impl<'a, T> IntoIterator for &'a EventArray<T> {
  type IntoIter = std::slice::Iter<'a, T>;
  type Item = &'a T;

  fn into_iter(self) -> Self::IntoIter {
    self.items.iter()
  }
}

impl<T> EventArray<T> {
  #[must_use]
  pub fn as_slice(&self) -> &[T] {
    &self.items
  }

  pub fn binary_search_by<F>(&self, compare: F) -> Result<usize, usize>
  where
    F: FnMut(&T) -> CmpOrdering,
  {
    self.items.binary_search_by(compare)
  }

  #[must_use]
  pub fn capacity(&self) -> ArrayCapacity {
    self.capacity
  }

  pub fn clear(&mut self) {
    self.items.clear();
  }

  /// Creates an array that holds at most `capacity` items.
  ///
  /// # Errors
  ///
  /// Returns [`ArrayError::OutOfMemory`] if the storage cannot be allocated.
  pub fn fixed(capacity: usize) -> Result<Self, ArrayError> {
    let capacity = capacity.max(1);
    let mut items = Vec::new();

    items
      .try_reserve_exact(capacity)
      .map_err(|_| ArrayError::OutOfMemory)?;

    Ok(Self {
      capacity: ArrayCapacity::Fixed(capacity),
      items,
    })
  }

  #[must_use]
  pub fn get(&self, index: usize) -> Option<&T> {
    self.items.get(index)
  }

  pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
    self.items.get_mut(index)
  }

  #[must_use]
  pub fn growable() -> Self {
    Self {
      capacity: ArrayCapacity::Growable,
      items: Vec::new(),
    }
  }

  /// Inserts `item` at `index`, shifting later items back.
  ///
  /// # Errors
  ///
  /// Fails when the array is fixed and full, or when growing it fails.
  ///
  /// # Panics
  ///
  /// Panics if `index > len`.
  pub fn insert(&mut self, index: usize, item: T) -> Result<(), ArrayError> {
    self.ensure_room()?;
    self.items.insert(index, item);
    Ok(())
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  #[must_use]
  pub fn is_full(&self) -> bool {
    match self.capacity {
      ArrayCapacity::Fixed(limit) => self.items.len() >= limit,
      ArrayCapacity::Growable => false,
    }
  }

  pub fn iter(&self) -> std::slice::Iter<'_, T> {
    self.items.iter()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.items.len()
  }

  /// Bytes held by the backing storage, used and unused.
  #[must_use]
  pub fn memory_footprint(&self) -> usize {
    self.items.capacity().saturating_mul(size_of::<T>())
  }

  /// Index of the first item for which `pred` is false, assuming the array is
  /// partitioned by `pred`.
  pub fn partition_point<P>(&self, pred: P) -> usize
  where
    P: FnMut(&T) -> bool,
  {
    self.items.partition_point(pred)
  }

  /// Appends `item`.
  ///
  /// # Errors
  ///
  /// Fails when the array is fixed and full, or when growing it fails.
  pub fn push(&mut self, item: T) -> Result<(), ArrayError> {
    self.ensure_room()?;
    self.items.push(item);
    Ok(())
  }

  pub fn remove(&mut self, index: usize) -> Option<T> {
    if index < self.items.len() {
      Some(self.items.remove(index))
    } else {
      None
    }
  }

  /// Sort hook; the comparator decides the order of the whole array.
  pub fn sort_by<F>(&mut self, compare: F)
  where
    F: FnMut(&T, &T) -> CmpOrdering,
  {
    self.items.sort_unstable_by(compare);
  }

  fn ensure_room(&mut self) -> Result<(), ArrayError> {
    if self.is_full() {
      return Err(ArrayError::Full);
    }

    if self.items.len() == self.items.capacity() {
      self
        .items
        .try_reserve(1)
        .map_err(|_| ArrayError::OutOfMemory)?;
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fixed_array_reports_full_instead_of_growing() {
    let mut array = EventArray::fixed(2).expect("allocate");

    assert_eq!(array.push(1_u32), Ok(()));
    assert_eq!(array.push(2), Ok(()));
    assert!(array.is_full());
    assert_eq!(array.push(3), Err(ArrayError::Full));
    assert_eq!(array.insert(0, 3), Err(ArrayError::Full));
    assert_eq!(array.as_slice(), &[1, 2]);
  }

  #[test]
  fn positional_insert_and_remove() {
    let mut array = EventArray::growable();
    for value in [10_u32, 30, 40] {
      array.push(value).expect("push");
    }

    array.insert(1, 20).expect("insert");
    assert_eq!(array.as_slice(), &[10, 20, 30, 40]);

    assert_eq!(array.remove(0), Some(10));
    assert_eq!(array.remove(10), None);
    assert_eq!(array.as_slice(), &[20, 30, 40]);
    assert_eq!(array.partition_point(|value| *value < 35), 2);
  }

  #[test]
  fn sort_hook_uses_the_given_comparator() {
    let mut array = EventArray::growable();
    for value in [3_u32, 1, 2] {
      array.push(value).expect("push");
    }

    array.sort_by(|a, b| b.cmp(a));

    assert_eq!(array.as_slice(), &[3, 2, 1]);
    assert_eq!(array.binary_search_by(|value| 2.cmp(value)), Ok(1));
  }

  #[test]
  fn footprint_counts_reserved_storage() {
    let array = EventArray::<u64>::fixed(16).expect("allocate");
    assert!(array.memory_footprint() >= 16 * size_of::<u64>());
    assert!(array.is_empty());
  }
}
