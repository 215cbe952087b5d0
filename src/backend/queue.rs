// Queue pool and leases
//
// Every surface borrows its graphics + present queues from the device's pool.
// Index 0 of each family is the shared queue: it backs every shared lease and the
// upload context, and is only ever touched while holding `shared_submit`.
// Indices 1.. are handed out exclusively and need no locking.

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Queue family indices a surface needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    pub fn is_unified(&self) -> bool {
        self.graphics == self.present
    }

    /// All surfaces share the families fixed by the first one.
    ///
    /// Panics when `derived` differs from `fixed`; a surface that can only present
    /// from another family is not supported.
    pub fn assert_compatible(fixed: &Self, derived: &Self) {
        assert!(
            fixed == derived,
            "surface requires queue families graphics={} present={}, but the device was created for graphics={} present={}",
            derived.graphics,
            derived.present,
            fixed.graphics,
            fixed.present,
        );
    }
}

struct FamilyQueues {
    family_index: u32,
    queues: Vec<vk::Queue>,
    /// Exclusive indices still available; never contains 0
    free: Vec<u32>,
}

impl FamilyQueues {
    fn new(family_index: u32, queues: Vec<vk::Queue>) -> Self {
        assert!(!queues.is_empty(), "queue family {} created with no queues", family_index);
        // Popped from the back, so lower indices go out first.
        let free = (1..queues.len() as u32).rev().collect();
        Self {
            family_index,
            queues,
            free,
        }
    }
}

/// Per-family queue handles plus free-lists for exclusive leasing
pub struct QueuePool {
    graphics: FamilyQueues,
    /// `None` when presentation happens on the graphics family
    present: Option<FamilyQueues>,
    shared_submit: Arc<Mutex<()>>,
}

impl QueuePool {
    pub fn new(
        families: QueueFamilyIndices,
        graphics_queues: Vec<vk::Queue>,
        present_queues: Vec<vk::Queue>,
    ) -> Self {
        let present = if families.is_unified() {
            None
        } else {
            Some(FamilyQueues::new(families.present, present_queues))
        };

        Self {
            graphics: FamilyQueues::new(families.graphics, graphics_queues),
            present,
            shared_submit: Arc::new(Mutex::new(())),
        }
    }

    pub fn families(&self) -> QueueFamilyIndices {
        QueueFamilyIndices {
            graphics: self.graphics.family_index,
            present: self.present_family().family_index,
        }
    }

    /// How many exclusive leases can be outstanding at once
    pub fn exclusive_capacity(&self) -> usize {
        let graphics = self.graphics.queues.len() - 1;
        match &self.present {
            Some(present) => graphics.min(present.queues.len() - 1),
            None => graphics,
        }
    }

    /// The graphics queue at index 0 together with the mutex that guards it
    pub fn shared_graphics(&self) -> (vk::Queue, Arc<Mutex<()>>) {
        (self.graphics.queues[0], self.shared_submit.clone())
    }

    /// Exclusive lease while free indices remain, shared lease otherwise
    pub fn acquire(&mut self) -> QueueLease {
        if let Some(index) = self.graphics.free.pop() {
            let present_index = match self.present.as_mut() {
                None => Some(index),
                Some(present) => present.free.pop(),
            };

            if let Some(present_index) = present_index {
                return QueueLease {
                    graphics: self.graphics.queues[index as usize],
                    present: self.present_family().queues[present_index as usize],
                    access: QueueAccess::Exclusive {
                        graphics_index: index,
                        present_index,
                    },
                };
            }

            self.graphics.free.push(index);
        }

        QueueLease {
            graphics: self.graphics.queues[0],
            present: self.present_family().queues[0],
            access: QueueAccess::Shared {
                submit_lock: self.shared_submit.clone(),
            },
        }
    }

    /// Return an exclusive lease's indices to the free-lists; shared leases are a no-op
    pub fn release(&mut self, lease: QueueLease) {
        if let QueueAccess::Exclusive {
            graphics_index,
            present_index,
        } = lease.access
        {
            debug_assert!(!self.graphics.free.contains(&graphics_index));
            self.graphics.free.push(graphics_index);
            if let Some(present) = self.present.as_mut() {
                present.free.push(present_index);
            }
        }
    }

    fn present_family(&self) -> &FamilyQueues {
        self.present.as_ref().unwrap_or(&self.graphics)
    }
}

/// How a lease may touch its queues
#[derive(Clone)]
pub enum QueueAccess {
    /// Queues owned by this lease alone
    Exclusive { graphics_index: u32, present_index: u32 },
    /// Queue 0, shared with other leases and the upload context
    Shared { submit_lock: Arc<Mutex<()>> },
}

/// Borrowed graphics + present queues
pub struct QueueLease {
    graphics: vk::Queue,
    present: vk::Queue,
    access: QueueAccess,
}

impl QueueLease {
    pub fn is_exclusive(&self) -> bool {
        matches!(self.access, QueueAccess::Exclusive { .. })
    }

    pub fn access(&self) -> &QueueAccess {
        &self.access
    }

    /// Run `f` with the queue handles, holding the shared submit lock if required.
    ///
    /// Everything that submits or presents must go through here.
    pub fn with_queues<R>(&self, f: impl FnOnce(vk::Queue, vk::Queue) -> R) -> R {
        match &self.access {
            QueueAccess::Exclusive { .. } => f(self.graphics, self.present),
            QueueAccess::Shared { submit_lock } => {
                let _guard = submit_lock.lock();
                f(self.graphics, self.present)
            }
        }
    }
}

impl std::fmt::Debug for QueueLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.access {
            QueueAccess::Exclusive {
                graphics_index,
                present_index,
            } => write!(f, "QueueLease::Exclusive({}, {})", graphics_index, present_index),
            QueueAccess::Shared { .. } => write!(f, "QueueLease::Shared"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn queues(family: u32, count: u64) -> Vec<vk::Queue> {
        (0..count)
            .map(|i| vk::Queue::from_raw(((family as u64) << 16) | (i + 1)))
            .collect()
    }

    fn unified_pool(count: u64) -> QueuePool {
        let families = QueueFamilyIndices { graphics: 0, present: 0 };
        QueuePool::new(families, queues(0, count), Vec::new())
    }

    #[test]
    fn hands_out_at_most_capacity_exclusive_leases() {
        let mut pool = unified_pool(4);
        let capacity = pool.exclusive_capacity();
        assert_eq!(capacity, 3);

        let leases: Vec<_> = (0..capacity).map(|_| pool.acquire()).collect();
        assert!(leases.iter().all(QueueLease::is_exclusive));

        let overflow = pool.acquire();
        match overflow.access() {
            QueueAccess::Shared { submit_lock } => {
                assert!(Arc::ptr_eq(submit_lock, &pool.shared_graphics().1));
            }
            QueueAccess::Exclusive { .. } => panic!("pool should be exhausted"),
        }
    }

    #[test]
    fn exclusive_leases_never_use_the_shared_queue() {
        let mut pool = unified_pool(3);
        let (shared, _) = pool.shared_graphics();
        for _ in 0..pool.exclusive_capacity() {
            let lease = pool.acquire();
            lease.with_queues(|graphics, present| {
                assert_ne!(graphics, shared);
                assert_eq!(graphics, present);
            });
        }
    }

    #[test]
    fn released_index_is_reused() {
        let mut pool = unified_pool(2);
        let first = pool.acquire();
        let QueueAccess::Exclusive { graphics_index, .. } = *first.access() else {
            panic!("expected an exclusive lease");
        };
        assert!(!pool.acquire().is_exclusive());

        pool.release(first);
        let again = pool.acquire();
        match again.access() {
            QueueAccess::Exclusive { graphics_index: index, .. } => assert_eq!(*index, graphics_index),
            QueueAccess::Shared { .. } => panic!("released index was not returned"),
        }
    }

    #[test]
    fn releasing_shared_lease_is_noop() {
        let mut pool = unified_pool(1);
        assert_eq!(pool.exclusive_capacity(), 0);
        let lease = pool.acquire();
        assert!(!lease.is_exclusive());
        pool.release(lease);
        assert!(!pool.acquire().is_exclusive());
    }

    #[test]
    fn shared_lease_holds_lock_while_submitting() {
        let mut pool = unified_pool(1);
        let lease = pool.acquire();
        let (_, lock) = pool.shared_graphics();
        lease.with_queues(|_, _| assert!(lock.is_locked()));
        assert!(!lock.is_locked());
    }

    #[test]
    fn split_families_lease_from_both() {
        let families = QueueFamilyIndices { graphics: 0, present: 2 };
        let mut pool = QueuePool::new(families, queues(0, 3), queues(2, 2));
        assert_eq!(pool.exclusive_capacity(), 1);
        assert_eq!(pool.families(), families);

        let lease = pool.acquire();
        assert!(lease.is_exclusive());
        lease.with_queues(|graphics, present| assert_ne!(graphics, present));

        // present family is out of exclusive queues, graphics index must not leak
        let shared = pool.acquire();
        assert!(!shared.is_exclusive());
        pool.release(lease);
        assert!(pool.acquire().is_exclusive());
    }

    #[test]
    fn matching_families_are_compatible() {
        let fixed = QueueFamilyIndices { graphics: 1, present: 1 };
        QueueFamilyIndices::assert_compatible(&fixed, &fixed.clone());
    }

    #[test]
    #[should_panic(expected = "surface requires queue families")]
    fn different_present_family_fails() {
        let fixed = QueueFamilyIndices { graphics: 0, present: 0 };
        let derived = QueueFamilyIndices { graphics: 0, present: 1 };
        QueueFamilyIndices::assert_compatible(&fixed, &derived);
    }
}
