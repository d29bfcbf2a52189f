use std::collections::HashSet;
use std::fmt::{Debug, Formatter, Result};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use crate::key::Key;

/// Where a contact is in an iterative lookup. Contacts outside of a lookup are always `Unset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContactStatus {
    Unset,
    Queried,
    Active,
    /// Answered a `FIND_VALUE` with the value itself.
    Returner,
}

impl Default for ContactStatus {
    fn default() -> Self {
        ContactStatus::Unset
    }
}

/// The id and address of a peer.
///
/// Two contacts are equal if their ids are equal.
#[derive(Clone, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "nodeID")]
    pub id: Key,
    pub ip: IpAddr,
    pub port: u16,
    #[serde(skip)]
    pub status: ContactStatus,
}

impl Contact {
    pub fn new(id: Key, addr: SocketAddr) -> Self {
        Contact {
            id,
            ip: addr.ip(),
            port: addr.port(),
            status: ContactStatus::Unset,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Returns a copy of `self` with a given lookup status.
    pub(crate) fn with_status(&self, status: ContactStatus) -> Self {
        Contact {
            status,
            ..self.clone()
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{} - {:?}", self.addr(), self.id)
    }
}

/// Returns at most `count` contacts from `contacts` ordered by ascending distance to `key`.
/// When an id appears more than once, its first occurrence is kept.
pub fn nearest<I>(key: &Key, contacts: I, count: usize) -> Vec<Contact>
where
    I: IntoIterator<Item = Contact>,
{
    let mut seen = HashSet::new();
    let mut ret: Vec<Contact> = contacts
        .into_iter()
        .filter(|contact| seen.insert(contact.id))
        .collect();
    ret.sort_by_key(|contact| contact.id.distance(key));
    ret.truncate(count);
    ret
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::SocketAddr;

    use super::{nearest, Contact, ContactStatus};
    use crate::key::Key;

    fn contact(id: Key) -> Contact {
        Contact::new(id, SocketAddr::from(([127, 0, 0, 1], 9000)))
    }

    #[test]
    fn test_nearest() {
        let key = Key::rand();
        let input: Vec<Contact> = (0..40).map(|_| contact(Key::rand())).collect();
        let mut with_duplicates = input.clone();
        with_duplicates.extend(input.iter().take(10).cloned());

        let ret = nearest(&key, with_duplicates, 20);
        assert_eq!(ret.len(), 20);

        let ids: HashSet<Key> = ret.iter().map(|contact| contact.id).collect();
        assert_eq!(ids.len(), ret.len());
        assert!(ret.iter().all(|contact| input.contains(contact)));
        for pair in ret.windows(2) {
            assert!(pair[0].id.distance(&key) <= pair[1].id.distance(&key));
        }

        let mut sorted = input.clone();
        sorted.sort_by_key(|contact| contact.id.distance(&key));
        assert_eq!(ret, sorted[..20].to_vec());
    }

    #[test]
    fn test_nearest_keeps_first_duplicate() {
        let key = Key::rand();
        let id = Key::rand();
        let ret = nearest(
            &key,
            vec![
                contact(id).with_status(ContactStatus::Active),
                contact(id),
            ],
            5,
        );
        assert_eq!(ret.len(), 1);
        assert_eq!(ret[0].status, ContactStatus::Active);
        assert!(nearest(&key, Vec::new(), 5).is_empty());
    }

    #[test]
    fn test_contact_wire_format() {
        let id = Key::rand();
        let json = serde_json::to_value(&contact(id).with_status(ContactStatus::Queried)).unwrap();
        assert_eq!(json["nodeID"], id.to_string());
        assert_eq!(json["ip"], "127.0.0.1");
        assert_eq!(json["port"], 9000);
        assert!(json.get("status").is_none());

        let decoded: Contact = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.status, ContactStatus::Unset);
        assert_eq!(decoded.addr(), SocketAddr::from(([127, 0, 0, 1], 9000)));
    }
}
