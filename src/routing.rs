use time::{Duration, SteadyTime};

use crate::key::Key;
use crate::node::contact::{self, Contact, ContactStatus};
use crate::ROUTING_TABLE_SIZE;

/// The bucket a self lookup starts from, since no single bucket holds the owner's own id.
const SELF_LOOKUP_BUCKET: usize = (ROUTING_TABLE_SIZE - 1) / 2;

/// A k-bucket in a node's routing table that has a maximum capacity of `k`.
///
/// The contacts in the k-bucket are sorted by the time of the most recent communication with those
/// which have been most recently communicated at the end of the list.
#[derive(Clone, Debug)]
struct RoutingBucket {
    contacts: Vec<Contact>,
    refresh_deadline: SteadyTime,
}

impl RoutingBucket {
    /// Constructs a new, empty `RoutingBucket`.
    fn new(refresh_deadline: SteadyTime) -> Self {
        RoutingBucket {
            contacts: Vec::new(),
            refresh_deadline,
        }
    }

    /// Moves `contact` to the end of the list if it already exists in the routing bucket.
    fn refresh_contact(&mut self, contact: Contact) -> bool {
        if !self.contains(&contact) {
            return false;
        }
        self.contacts.retain(|data| *data != contact);
        self.contacts.push(contact);
        true
    }

    /// Returns `true` if `contact` exists in the routing bucket.
    fn contains(&self, contact: &Contact) -> bool {
        self.contacts.iter().any(|data| data == contact)
    }

    /// Returns the least recently seen contact.
    fn head(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    /// Returns a slice of the contacts contained by the routing bucket.
    fn get_contacts(&self) -> &[Contact] {
        self.contacts.as_slice()
    }

    /// Returns `true` if the routing bucket has not been touched by a lookup before its deadline.
    fn is_stale(&self, now: SteadyTime) -> bool {
        now >= self.refresh_deadline
    }

    /// Returns the number of contacts in the routing bucket.
    fn size(&self) -> usize {
        self.contacts.len()
    }
}

/// The result of offering a contact to the routing table.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    /// The contact was added to a bucket with free space.
    Inserted,
    /// The contact was already known and moved to the most recently seen end of its bucket.
    Refreshed,
    /// The bucket is full. The caller must ping the least recently seen contact, which is
    /// returned, and call `replace_stale` if it does not answer.
    Full(Contact),
    /// The contact is the owner of the routing table.
    Ignored,
}

/// A node's routing table.
///
/// `RoutingTable` has one bucket for every bit of the key space. Bucket `i` holds the contacts
/// whose distance to the owner has its highest set bit at position `i`.
#[derive(Clone, Debug)]
pub struct RoutingTable {
    buckets: Vec<RoutingBucket>,
    id: Key,
    capacity: usize,
    refresh_interval: Duration,
}

impl RoutingTable {
    /// Constructs a new, empty `RoutingTable` owned by `id`.
    pub fn new(id: Key, capacity: usize, refresh_interval: u64) -> Self {
        let refresh_interval = Duration::milliseconds(refresh_interval as i64);
        let refresh_deadline = SteadyTime::now() + refresh_interval;
        RoutingTable {
            buckets: vec![RoutingBucket::new(refresh_deadline); ROUTING_TABLE_SIZE],
            id,
            capacity,
            refresh_interval,
        }
    }

    /// Upserts a contact into the routing table. A known contact moves to the most recently seen
    /// end of its bucket, and an unknown contact is appended if its bucket has room.
    pub fn update(&mut self, contact: Contact) -> UpdateOutcome {
        let index = match contact.id.bucket_index(&self.id) {
            Some(index) => index,
            None => return UpdateOutcome::Ignored,
        };
        let contact = contact.with_status(ContactStatus::Unset);
        let bucket = &mut self.buckets[index];

        if bucket.refresh_contact(contact.clone()) {
            UpdateOutcome::Refreshed
        } else if bucket.size() < self.capacity {
            bucket.contacts.push(contact);
            UpdateOutcome::Inserted
        } else {
            match bucket.head() {
                Some(head) => UpdateOutcome::Full(head.clone()),
                None => UpdateOutcome::Ignored,
            }
        }
    }

    /// Evicts `stale` from the bucket of `contact` and appends `contact` in its place. Returns
    /// `false` if `stale` was no longer in the bucket, in which case the bucket is left as is.
    pub fn replace_stale(&mut self, stale: &Contact, contact: Contact) -> bool {
        let index = match contact.id.bucket_index(&self.id) {
            Some(index) => index,
            None => return false,
        };
        let capacity = self.capacity;
        let bucket = &mut self.buckets[index];
        if !bucket.contains(stale) {
            return false;
        }

        let mut contacts: Vec<Contact> = bucket
            .contacts
            .iter()
            .filter(|data| *data != stale && **data != contact)
            .cloned()
            .collect();
        if contacts.len() < capacity {
            contacts.push(contact.with_status(ContactStatus::Unset));
        }
        bucket.contacts = contacts;
        true
    }

    /// Returns the closest `count` contacts to `key`.
    ///
    /// Candidates are gathered from the bucket that would hold `key`, then from the buckets
    /// above and below it at increasing offsets until there are `count` of them.
    pub fn get_closest_contacts(&self, key: &Key, count: usize) -> Vec<Contact> {
        let origin = key.bucket_index(&self.id).unwrap_or(SELF_LOOKUP_BUCKET);
        let mut ret = Vec::new();
        ret.extend_from_slice(self.buckets[origin].get_contacts());

        let mut offset = 1;
        while ret.len() < count && (offset <= origin || origin + offset < ROUTING_TABLE_SIZE) {
            if origin + offset < ROUTING_TABLE_SIZE {
                ret.extend_from_slice(self.buckets[origin + offset].get_contacts());
            }
            if offset <= origin {
                ret.extend_from_slice(self.buckets[origin - offset].get_contacts());
            }
            offset += 1;
        }

        contact::nearest(key, ret, count)
    }

    /// Pushes back the refresh deadline of the bucket that `key` belongs to.
    pub fn touch(&mut self, key: &Key) {
        if let Some(index) = key.bucket_index(&self.id) {
            self.reset_refresh(index);
        }
    }

    /// Pushes back the refresh deadline of bucket `index`.
    pub fn reset_refresh(&mut self, index: usize) {
        self.buckets[index].refresh_deadline = SteadyTime::now() + self.refresh_interval;
    }

    /// Returns a list of all the routing buckets whose refresh deadline has passed.
    pub fn get_stale_indexes(&self) -> Vec<usize> {
        let now = SteadyTime::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| bucket.is_stale(now))
            .map(|(index, _)| index)
            .collect()
    }

    /// Returns the index of the closest bucket holding at least one contact.
    pub fn nearest_populated(&self) -> Option<usize> {
        self.buckets.iter().position(|bucket| bucket.size() > 0)
    }

    /// Returns the non-empty buckets with their indexes.
    pub fn populated_buckets(&self) -> Vec<(usize, Vec<Contact>)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| bucket.size() > 0)
            .map(|(index, bucket)| (index, bucket.get_contacts().to_vec()))
            .collect()
    }

    /// Returns `true` if `contact` is in the routing table.
    #[cfg(test)]
    pub fn contains(&self, contact: &Contact) -> bool {
        contact
            .id
            .bucket_index(&self.id)
            .map_or(false, |index| self.buckets[index].contains(contact))
    }

    /// Returns the number of contacts in the routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(RoutingBucket::size).sum()
    }
}
