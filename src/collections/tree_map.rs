use bytemuck::Pod;
use std::borrow::Cow;
use std::cmp::{max, Ordering};

use super::pool::{GrowReport, NodeHeader, NodePool, PoolLayout, Register, MAX_KEY_LEN, SENTINEL};
use crate::error::{Error, Result};

/// AVL tree map, which is a self-balancing binary search tree. Entries in the
/// tree are stored as such the height of two sibling subtrees differ by one at
/// most.
///
/// Nodes live in a flat block of fixed-size slots and reference each other by
/// slot index, never by address. The block can be copied to another address
/// and attached again, or enlarged in place, without invalidating the tree.
///
/// A map over `&[u8]` is read-only; a map over `&mut [u8]` (or any other
/// block implementing [`AsMut<[u8]>`]) is writable.
pub struct TreeMap<B> {
    /// Slots storing the tree and its free list.
    pool: NodePool<B>,
}

impl<B: AsRef<[u8]>> TreeMap<B> {
    /// Loads a map from a block that already holds one.
    ///
    /// This is used to re-point a map at a copy of its block (e.g., a shared
    /// memory segment mapped at a different address).
    ///
    /// # Arguments
    ///
    /// * `block` - the block holding the map.
    /// * `layout` - the layout of the map, as returned by [`TreeMap::layout`].
    pub fn attach(block: B, layout: PoolLayout) -> Result<Self> {
        Ok(Self {
            pool: NodePool::attach(block, layout)?,
        })
    }

    /// Adopts a block that was enlarged (and relinked) by another owner.
    ///
    /// Only the local view of the map changes; the free list is taken from the
    /// block as it is. See [`TreeMap::relink_grown`] for the owner side.
    pub fn adopt_grown(block: B, layout: PoolLayout) -> Result<(Self, GrowReport)> {
        let (pool, report) = NodePool::grown(block, layout)?;
        Ok((Self { pool }, report))
    }

    /// Returns the layout of the map.
    pub fn layout(&self) -> PoolLayout {
        self.pool.layout()
    }

    /// Returns the underlying block.
    pub fn into_inner(self) -> B {
        self.pool.into_inner()
    }

    /// Returns the maximum number of entries of the map.
    pub fn capacity(&self) -> usize {
        self.pool.layout().capacity()
    }

    /// Returns the size (in bytes) of the value of an entry.
    pub fn payload_size(&self) -> usize {
        self.pool.layout().payload_size()
    }

    /// Indicates whether a new entry can be added or not.
    pub fn is_pool_exhausted(&self) -> bool {
        self.pool.is_exhausted()
    }

    /// Returns the number of unused slots.
    pub fn free_slots(&self) -> usize {
        self.pool.free_slots()
    }

    /// Returns the number of entries in the map.
    ///
    /// The entries are counted on each call by traversing the tree. The count
    /// stops at the number of slots if the tree is corrupted.
    pub fn len(&self) -> usize {
        let slots = self.pool.layout().slots();
        let mut stack = vec![self.pool.root()];
        let mut count = 0;

        while let Some(index) = stack.pop() {
            if index == SENTINEL {
                continue;
            }

            count += 1;

            if count == slots {
                break;
            }

            stack.push(self.pool.register(index, Register::Left));
            stack.push(self.pool.register(index, Register::Right));
        }

        count
    }

    /// Indicates whether the map is empty or not.
    pub fn is_empty(&self) -> bool {
        self.pool.root() == SENTINEL
    }

    /// Returns the height of the tree (`0` when the map is empty).
    pub fn height(&self) -> usize {
        self.node_height(self.pool.root()) as usize
    }

    /// Return the value under the specified key, if one is found.
    ///
    /// # Arguments
    ///
    /// * `key` - key to look up the value.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.find(key.as_bytes())
            .map(|node_index| self.pool.payload(node_index))
    }

    /// Return a copy of the value under the specified key, if one is found
    /// and its size matches `V`.
    pub fn get_pod<V: Pod>(&self, key: &str) -> Option<V> {
        self.get(key)
            .and_then(|payload| bytemuck::try_pod_read_unaligned(payload).ok())
    }

    /// Checks whether a key is present in the map or not.
    ///
    /// # Arguments
    ///
    /// * `key` - the key of the entry.
    pub fn contains(&self, key: &str) -> bool {
        self.find(key.as_bytes()).is_some()
    }

    /// Returns the lowest key, if the map is not empty.
    pub fn first_key(&self) -> Option<Cow<'_, str>> {
        let mut node = self.pool.root();

        if node == SENTINEL {
            return None;
        }

        while self.pool.register(node, Register::Left) != SENTINEL {
            node = self.pool.register(node, Register::Left);
        }

        Some(String::from_utf8_lossy(self.pool.key(node)))
    }

    /// Returns an iterator over the keys of the map.
    ///
    /// Keys are visited in pre-order: a node, then its left subtree, then its
    /// right subtree.
    pub fn keys(&self) -> Keys<'_, B> {
        let root = self.pool.root();
        let mut stack = Vec::with_capacity(self.height() + 1);

        if root != SENTINEL {
            stack.push(root);
        }

        Keys { map: self, stack }
    }

    /// Checks the structure of the map.
    ///
    /// Every reachable index must be in range and reachable once, heights must
    /// match the children, sibling subtrees must differ in height by one at
    /// most, keys must be strictly ordered, and every slot except the reserved
    /// one must be either in the tree or on the free list.
    pub fn verify(&self) -> Result<()> {
        let slots = self.pool.layout().slots();
        let mut seen = vec![false; slots];
        seen[0] = true;

        let max_depth = height_bound(slots - 1);
        let (_, live) =
            self.check_subtree(self.pool.root(), 1, max_depth, None, None, &mut seen)?;

        let mut free = 0;
        let mut index = self.pool.free_list_head();

        while index != SENTINEL {
            if index as usize >= slots {
                return Err(Error::Corrupted(format!(
                    "free slot {index} out of range (capacity {slots})"
                )));
            }

            if seen[index as usize] {
                return Err(Error::Corrupted(format!("slot {index} reachable twice")));
            }

            seen[index as usize] = true;
            free += 1;
            index = self.pool.register(index, Register::Right);
        }

        if live + free != slots - 1 {
            return Err(Error::Corrupted(format!(
                "{live} live and {free} free slots, expected {} in total",
                slots - 1
            )));
        }

        Ok(())
    }

    fn find(&self, key: &[u8]) -> Option<u32> {
        let mut reference_node = self.pool.root();

        while reference_node != SENTINEL {
            let target = match key.cmp(self.pool.key(reference_node)) {
                Ordering::Less => self.pool.register(reference_node, Register::Left),
                Ordering::Greater => self.pool.register(reference_node, Register::Right),
                Ordering::Equal => return Some(reference_node),
            };

            reference_node = target;
        }

        None
    }

    #[inline]
    fn node_height(&self, index: u32) -> u32 {
        if index == SENTINEL {
            0
        } else {
            self.pool.register(index, Register::Height)
        }
    }

    /// Calculate the balance factor of a node.
    ///
    /// The balance factor is the height of the right subtree minus the height
    /// of the left subtree.
    fn balance_factor(&self, index: u32) -> i32 {
        // safe to convert to i32 since height will be at most 1.44 * log2(capacity)
        let left = self.node_height(self.pool.register(index, Register::Left)) as i32;
        let right = self.node_height(self.pool.register(index, Register::Right)) as i32;

        right - left
    }

    /// Checks a subtree, returning its height and number of nodes.
    ///
    /// The walk stops at `max_depth`, so a corrupted block cannot exhaust the
    /// call stack.
    fn check_subtree<'s>(
        &'s self,
        index: u32,
        depth: u32,
        max_depth: u32,
        lower: Option<&'s [u8]>,
        upper: Option<&'s [u8]>,
        seen: &mut [bool],
    ) -> Result<(u32, usize)> {
        if index == SENTINEL {
            return Ok((0, 0));
        }

        if depth > max_depth {
            return Err(Error::Corrupted(format!(
                "node {index} is deeper than {max_depth} levels"
            )));
        }

        if index as usize >= seen.len() {
            return Err(Error::Corrupted(format!(
                "node {index} out of range (capacity {})",
                seen.len()
            )));
        }

        if seen[index as usize] {
            return Err(Error::Corrupted(format!("slot {index} reachable twice")));
        }

        seen[index as usize] = true;

        let key_len = self.pool.register(index, Register::KeyLen) as usize;

        if key_len > MAX_KEY_LEN {
            return Err(Error::Corrupted(format!(
                "node {index} has a key of {key_len} bytes"
            )));
        }

        let key = self.pool.key(index);

        if lower.is_some_and(|lower| key <= lower) || upper.is_some_and(|upper| key >= upper) {
            return Err(Error::Corrupted(format!("node {index} is out of order")));
        }

        let (left_height, left_count) = self.check_subtree(
            self.pool.register(index, Register::Left),
            depth + 1,
            max_depth,
            lower,
            Some(key),
            seen,
        )?;
        let (right_height, right_count) = self.check_subtree(
            self.pool.register(index, Register::Right),
            depth + 1,
            max_depth,
            Some(key),
            upper,
            seen,
        )?;

        let height = max(left_height, right_height) + 1;

        if self.pool.register(index, Register::Height) != height {
            return Err(Error::Corrupted(format!(
                "node {index} has height {}, expected {height}",
                self.pool.register(index, Register::Height)
            )));
        }

        if left_height.abs_diff(right_height) > 1 {
            return Err(Error::Corrupted(format!(
                "node {index} is unbalanced ({left_height} vs {right_height})"
            )));
        }

        Ok((height, left_count + right_count + 1))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> TreeMap<B> {
    /// Initializes a map over the whole block.
    ///
    /// Any previous content of the block is discarded. The capacity of the map
    /// is determined by the block length and the payload size; use
    /// [`estimate_required_bytes`](crate::estimate_required_bytes) to size the
    /// block.
    ///
    /// # Arguments
    ///
    /// * `block` - the block to store the map.
    /// * `payload_size` - the size (in bytes) of the value of every entry.
    pub fn initialize(block: B, payload_size: usize) -> Result<Self> {
        Ok(Self {
            pool: NodePool::initialize(block, payload_size)?,
        })
    }

    /// Grows the map over an enlarged block, linking the new slots into the
    /// free list.
    ///
    /// The block must start with the content of the map's previous block;
    /// whether it sits at the same address or not does not matter. Exactly one
    /// owner of a shared block calls this; every other observer calls
    /// [`TreeMap::adopt_grown`].
    ///
    /// # Arguments
    ///
    /// * `block` - the enlarged block.
    /// * `layout` - the layout of the map before growing.
    pub fn relink_grown(block: B, layout: PoolLayout) -> Result<(Self, GrowReport)> {
        let (pool, report) = NodePool::relink_grown(block, layout)?;
        Ok((Self { pool }, report))
    }

    /// Return a mutable reference to the value under the specified key, if
    /// one is found.
    ///
    /// # Arguments
    ///
    /// * `key` - key to look up the value.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut [u8]> {
        self.find(key.as_bytes())
            .map(|node_index| self.pool.payload_mut(node_index))
    }

    /// Insert a value on the map at the specified key.
    ///
    /// The value of an existing key is overwritten. Returns `true` when a new
    /// entry was created. When an error is returned the map is left unchanged.
    ///
    /// # Arguments
    ///
    /// * `key` - the key of the entry.
    /// * `value` - the value of the entry.
    pub fn insert(&mut self, key: &str, value: &[u8]) -> Result<bool> {
        let key = key.as_bytes();

        if key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }

        if value.len() != self.payload_size() {
            return Err(Error::PayloadSizeMismatch {
                expected: self.payload_size(),
                actual: value.len(),
            });
        }

        let (root, created) = self.insert_at(self.pool.root(), key, value)?;
        self.pool.set_root(root);

        Ok(created)
    }

    /// Insert a plain value on the map at the specified key.
    ///
    /// The size of `V` must match the payload size of the map.
    pub fn insert_pod<V: Pod>(&mut self, key: &str, value: &V) -> Result<bool> {
        self.insert(key, bytemuck::bytes_of(value))
    }

    /// Removes the entry under the specified key.
    ///
    /// Returns `false` when the key is not present.
    pub fn remove(&mut self, key: &str) -> bool {
        let (root, removed) = self.remove_at(self.pool.root(), key.as_bytes());

        if removed {
            self.pool.set_root(root);
        }

        removed
    }

    /// Inserts into the subtree rooted at `index`, returning the new root of the
    /// subtree and whether a node was created.
    ///
    /// Child links are only updated after the recursive call succeeded, so an
    /// error leaves the subtree untouched.
    fn insert_at(&mut self, index: u32, key: &[u8], value: &[u8]) -> Result<(u32, bool)> {
        if index == SENTINEL {
            return Ok((self.add(key, value)?, true));
        }

        let branch = match key.cmp(self.pool.key(index)) {
            Ordering::Less => Register::Left,
            Ordering::Greater => Register::Right,
            Ordering::Equal => {
                self.pool.payload_mut(index).copy_from_slice(value);
                return Ok((index, false));
            }
        };

        let (child, created) = self.insert_at(self.pool.register(index, branch), key, value)?;
        self.pool.set_register(index, branch, child);

        Ok((self.rebalance(index), created))
    }

    /// Removes from the subtree rooted at `index`, returning the new root of the
    /// subtree and whether a node was removed.
    fn remove_at(&mut self, index: u32, key: &[u8]) -> (u32, bool) {
        if index == SENTINEL {
            return (SENTINEL, false);
        }

        let branch = match key.cmp(self.pool.key(index)) {
            Ordering::Less => Register::Left,
            Ordering::Greater => Register::Right,
            Ordering::Equal => {
                let left = self.pool.register(index, Register::Left);
                let right = self.pool.register(index, Register::Right);

                let replacement = if left == SENTINEL {
                    right
                } else if right == SENTINEL {
                    left
                } else {
                    // the in-order successor takes the place of the node
                    let (rest, successor) = self.detach_lowest(right);
                    self.pool.set_register(successor, Register::Left, left);
                    self.pool.set_register(successor, Register::Right, rest);
                    self.rebalance(successor)
                };

                self.pool.release(index);
                return (replacement, true);
            }
        };

        let (child, removed) = self.remove_at(self.pool.register(index, branch), key);

        if !removed {
            return (index, false);
        }

        self.pool.set_register(index, branch, child);

        (self.rebalance(index), true)
    }

    /// Unlinks the lowest node of a subtree, returning the new root of the
    /// subtree and the index of the unlinked node.
    fn detach_lowest(&mut self, index: u32) -> (u32, u32) {
        let left = self.pool.register(index, Register::Left);

        if left == SENTINEL {
            return (self.pool.register(index, Register::Right), index);
        }

        let (rest, lowest) = self.detach_lowest(left);
        self.pool.set_register(index, Register::Left, rest);

        (self.rebalance(index), lowest)
    }

    /// Adds a leaf node.
    ///
    /// # Arguments
    ///
    /// * `key` - the key of the node.
    /// * `value` - the value of the node.
    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<u32> {
        let header = NodeHeader::leaf(key).ok_or(Error::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        })?;

        let index = self.pool.allocate()?;
        self.pool.write_node(index, &header, value);

        Ok(index)
    }

    /// Updates the height of a node and rebalances it to maintain the AVL rule,
    /// returning the index of the node now at its position.
    ///
    /// The AVL rule maintains the difference in height of two sibling subtrees
    /// by one at most. Callers visit every node on the path back to the root.
    fn rebalance(&mut self, index: u32) -> u32 {
        self.update_height(index);

        let balance_factor = self.balance_factor(index);

        if balance_factor < -1 {
            let left = self.pool.register(index, Register::Left);

            if self.balance_factor(left) > 0 {
                let pivot = self.left_rotate(left);
                self.pool.set_register(index, Register::Left, pivot);
            }

            self.right_rotate(index)
        } else if balance_factor > 1 {
            let right = self.pool.register(index, Register::Right);

            if self.balance_factor(right) < 0 {
                let pivot = self.right_rotate(right);
                self.pool.set_register(index, Register::Right, pivot);
            }

            self.left_rotate(index)
        } else {
            index
        }
    }

    /// Perform a left AVL rotation.
    ///
    /// # Arguments
    ///
    /// * `index` - index of the unbalanced node.
    fn left_rotate(&mut self, index: u32) -> u32 {
        let right = self.pool.register(index, Register::Right);
        let right_left = self.pool.register(right, Register::Left);

        self.pool.set_register(index, Register::Right, right_left);
        self.pool.set_register(right, Register::Left, index);

        self.update_height(index);
        self.update_height(right);

        right
    }

    /// Perform a right AVL rotation.
    ///
    /// # Arguments
    ///
    /// * `index` - index of the unbalanced node.
    fn right_rotate(&mut self, index: u32) -> u32 {
        let left = self.pool.register(index, Register::Left);
        let left_right = self.pool.register(left, Register::Right);

        self.pool.set_register(index, Register::Left, left_right);
        self.pool.set_register(left, Register::Right, index);

        self.update_height(index);
        self.update_height(left);

        left
    }

    /// Updates the height of a node.
    ///
    /// The height of a node is determined by the height of the larger child's
    /// subtree plus one.
    fn update_height(&mut self, index: u32) {
        let left = self.node_height(self.pool.register(index, Register::Left));
        let right = self.node_height(self.pool.register(index, Register::Right));

        self.pool
            .set_register(index, Register::Height, max(left, right) + 1);
    }
}

/// Returns the greatest height of an AVL tree holding `nodes` nodes.
fn height_bound(nodes: usize) -> u32 {
    // node count of the sparsest trees of the previous and current height
    let (mut previous, mut sparsest) = (0usize, 1usize);
    let mut height = 0;

    while sparsest <= nodes {
        (previous, sparsest) = (sparsest, sparsest.saturating_add(previous).saturating_add(1));
        height += 1;
    }

    height
}

/// Iterator over the keys of a [`TreeMap`], in pre-order.
pub struct Keys<'a, B> {
    map: &'a TreeMap<B>,
    stack: Vec<u32>,
}

impl<'a, B: AsRef<[u8]>> Iterator for Keys<'a, B> {
    type Item = Cow<'a, str>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.stack.pop()?;
        let pool = &self.map.pool;

        let right = pool.register(index, Register::Right);
        let left = pool.register(index, Register::Left);

        if right != SENTINEL {
            self.stack.push(right);
        }

        if left != SENTINEL {
            self.stack.push(left);
        }

        Some(String::from_utf8_lossy(pool.key(index)))
    }
}
