use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::mpsc::channel;
use std::thread;

use super::contact::{self, Contact, ContactStatus};
use super::{FindValueResult, Node};
use crate::key::Key;
use crate::lock;
use crate::protocol::Reply;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum LookupKind {
    FindNode,
    FindValue,
}

/// What a lookup round decided.
#[derive(Debug, PartialEq)]
pub(super) enum Step {
    /// Query the next round of unqueried contacts.
    Continue,
    /// Every contact in the shortlist answered.
    Contacts(Vec<Contact>),
    /// A contact returned the value. Carries the closest contact that answered without it, which
    /// is where the value gets cached.
    Value(String, Option<Contact>),
}

/// The state of one iterative lookup carried from round to round.
///
/// Each round queries up to `query_number` unqueried contacts from the front of the shortlist
/// and waits for every one of them to answer or time out. The answers are then folded into the
/// shortlist, which is trimmed back to the `k` closest contacts to the target. A contact is
/// queried at most once per lookup, so a lookup always terminates.
#[derive(Debug)]
pub(super) struct Lookup {
    key: Key,
    kind: LookupKind,
    shortlist: Vec<Contact>,
    query_number: usize,
    responded: HashMap<Key, ContactStatus>,
    failed: HashSet<Key>,
    alpha: usize,
    k: usize,
}

impl Lookup {
    pub(super) fn new(
        key: Key,
        kind: LookupKind,
        shortlist: Vec<Contact>,
        alpha: usize,
        k: usize,
    ) -> Self {
        Lookup {
            key,
            kind,
            shortlist: shortlist
                .into_iter()
                .map(|data| data.with_status(ContactStatus::Unset))
                .collect(),
            query_number: alpha,
            responded: HashMap::new(),
            failed: HashSet::new(),
            alpha,
            k,
        }
    }

    /// Marks the contacts of the next round as queried and returns them.
    pub(super) fn next_targets(&mut self) -> Vec<Contact> {
        let query_number = self.query_number;
        self.shortlist
            .iter_mut()
            .filter(|data| data.status == ContactStatus::Unset)
            .take(query_number)
            .map(|data| {
                data.status = ContactStatus::Queried;
                data.clone()
            })
            .collect()
    }

    /// Folds the answers of a completed round into the shortlist and decides what happens next.
    /// A `None` answer is a timeout. Only a value lookup accepts a value as an answer.
    pub(super) fn evaluate(&mut self, answers: Vec<(Key, Option<Reply>)>, own_id: &Key) -> Step {
        let prev_closest = self.shortlist.first().map(|data| data.id);
        let mut discovered = Vec::new();
        let mut value = None;

        for (id, answer) in answers {
            let status = match answer {
                Some(Reply::Contacts(contacts)) => {
                    discovered.extend(contacts);
                    ContactStatus::Active
                },
                Some(Reply::Value(found)) if self.kind == LookupKind::FindValue => {
                    value.get_or_insert(found);
                    ContactStatus::Returner
                },
                // a value answering a node lookup is treated like no answer at all
                Some(Reply::Value(_)) | None => {
                    self.failed.insert(id);
                    continue;
                },
            };
            self.responded.insert(id, status);
            if let Some(data) = self.shortlist.iter_mut().find(|data| data.id == id) {
                data.status = status;
            }
        }

        let responded = &self.responded;
        let failed = &self.failed;
        let discovered = discovered.into_iter().map(|data| {
            let status = responded
                .get(&data.id)
                .copied()
                .unwrap_or(ContactStatus::Unset);
            data.with_status(status)
        });
        let candidates: Vec<Contact> = mem::replace(&mut self.shortlist, Vec::new())
            .into_iter()
            .chain(discovered)
            .filter(|data| data.id != *own_id && !failed.contains(&data.id))
            .collect();
        self.shortlist = contact::nearest(&self.key, candidates, self.k);

        if let Some(value) = value {
            let cache_target = self
                .shortlist
                .iter()
                .find(|data| data.status == ContactStatus::Active)
                .cloned();
            return Step::Value(value, cache_target);
        }

        if self
            .shortlist
            .iter()
            .all(|data| data.status != ContactStatus::Unset)
        {
            return Step::Contacts(self.shortlist.clone());
        }

        // a round that did not get closer is followed by a sweep of every unqueried contact
        self.query_number = if self.shortlist.first().map(|data| data.id) == prev_closest {
            self.k
        } else {
            self.alpha
        };
        Step::Continue
    }

    pub(super) fn key(&self) -> &Key {
        &self.key
    }

    pub(super) fn kind(&self) -> LookupKind {
        self.kind
    }
}

impl Node {
    /// Iteratively looks up the `k` closest contacts to `key` that answer.
    pub(super) fn lookup_nodes(&self, key: &Key) -> Vec<Contact> {
        match self.lookup(key, LookupKind::FindNode) {
            Step::Contacts(contacts) => contacts,
            step => {
                warn!("{:?} - Node lookup ended with {:?}", self.contact, step);
                Vec::new()
            },
        }
    }

    /// Iteratively looks up the value of `key`. If it is found, the value is also stored at the
    /// closest contact that did not have it.
    pub(super) fn lookup_value(&self, key: &Key) -> FindValueResult {
        match self.lookup(key, LookupKind::FindValue) {
            Step::Value(value, cache_target) => {
                if let Some(dest) = cache_target {
                    debug!("{:?} - Caching {:?} at {:?}", self.contact, key, dest);
                    self.rpc_store(&dest, *key, value.clone());
                }
                FindValueResult::Found(value)
            },
            Step::Contacts(contacts) => FindValueResult::NotFound(contacts),
            Step::Continue => FindValueResult::NotFound(Vec::new()),
        }
    }

    fn lookup(&self, key: &Key, kind: LookupKind) -> Step {
        let shortlist = lock(&self.routing_table).get_closest_contacts(key, self.config.alpha);
        let mut lookup = Lookup::new(*key, kind, shortlist, self.config.alpha, self.config.k);

        loop {
            let answers = self.run_round(&mut lookup);
            match lookup.evaluate(answers, &self.contact.id) {
                Step::Continue => {},
                step => {
                    debug!("{:?} - Lookup of {:?} ended with {:?}", self.contact, key, step);
                    return step;
                },
            }
        }
    }

    /// Queries the next round of contacts in parallel and waits until every query has been
    /// answered or has timed out.
    fn run_round(&self, lookup: &mut Lookup) -> Vec<(Key, Option<Reply>)> {
        let targets = lookup.next_targets();
        let (tx, rx) = channel();

        for dest in targets {
            // a query counts as activity in the bucket of the queried contact
            lock(&self.routing_table).touch(&dest.id);

            let node = self.clone();
            let key = *lookup.key();
            let kind = lookup.kind();
            let tx = tx.clone();
            thread::spawn(move || {
                let answer = match kind {
                    LookupKind::FindNode => node.rpc_find_node(&dest, &key),
                    LookupKind::FindValue => node.rpc_find_value(&dest, &key),
                };
                if tx.send((dest.id, answer)).is_err() {
                    warn!("Receiver closed channel before rpc returned.");
                }
            });
        }
        drop(tx);

        rx.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::{Lookup, LookupKind, Step};
    use crate::key::Key;
    use crate::node::contact::{Contact, ContactStatus};
    use crate::protocol::Reply;

    fn contact(id: Key) -> Contact {
        Contact::new(id, SocketAddr::from(([127, 0, 0, 1], 9000)))
    }

    /// Returns `count` contacts sorted by ascending distance to `key`.
    fn sorted_contacts(key: &Key, count: usize) -> Vec<Contact> {
        let mut ret: Vec<Contact> = (0..count).map(|_| contact(Key::rand())).collect();
        ret.sort_by_key(|data| data.id.distance(key));
        ret
    }

    #[test]
    fn test_empty_shortlist_terminates() {
        let own_id = Key::rand();
        let mut lookup = Lookup::new(Key::rand(), LookupKind::FindNode, Vec::new(), 3, 20);
        assert!(lookup.next_targets().is_empty());
        assert_eq!(lookup.evaluate(Vec::new(), &own_id), Step::Contacts(Vec::new()));
    }

    #[test]
    fn test_round_queries_alpha_contacts() {
        let key = Key::rand();
        let contacts = sorted_contacts(&key, 5);
        let mut lookup = Lookup::new(key, LookupKind::FindNode, contacts.clone(), 3, 20);

        let targets = lookup.next_targets();
        assert_eq!(targets, contacts[..3].to_vec());
        assert!(targets.iter().all(|data| data.status == ContactStatus::Queried));
        assert_eq!(lookup.next_targets(), contacts[3..].to_vec());
    }

    #[test]
    fn test_timeouts_are_removed() {
        let own_id = Key::rand();
        let key = Key::rand();
        let contacts = sorted_contacts(&key, 3);
        let mut lookup = Lookup::new(key, LookupKind::FindNode, contacts.clone(), 3, 20);
        lookup.next_targets();

        let answers = vec![
            (contacts[0].id, None),
            (contacts[1].id, Some(Reply::Contacts(vec![contacts[0].clone()]))),
            (contacts[2].id, Some(Reply::Contacts(Vec::new()))),
        ];
        match lookup.evaluate(answers, &own_id) {
            Step::Contacts(ret) => {
                assert_eq!(ret, contacts[1..].to_vec());
                assert!(ret.iter().all(|data| data.status == ContactStatus::Active));
            },
            step => panic!("unexpected step {:?}", step),
        }
    }

    #[test]
    fn test_query_number_follows_convergence() {
        let own_id = Key::rand();
        let key = Key::rand();
        let contacts = sorted_contacts(&key, 30);
        let mut lookup = Lookup::new(key, LookupKind::FindNode, contacts[10..13].to_vec(), 3, 20);

        // closer contacts were found, so the next round stays at alpha
        lookup.next_targets();
        let answers = contacts[10..13]
            .iter()
            .map(|data| (data.id, Some(Reply::Contacts(contacts[..10].to_vec()))))
            .collect();
        assert_eq!(lookup.evaluate(answers, &own_id), Step::Continue);
        assert_eq!(lookup.next_targets().len(), 3);

        // nothing closer was found, so every unqueried contact is swept
        let answers = contacts[..3]
            .iter()
            .map(|data| (data.id, Some(Reply::Contacts(vec![contacts[20].clone()]))))
            .collect();
        assert_eq!(lookup.evaluate(answers, &own_id), Step::Continue);
        let targets = lookup.next_targets();
        assert_eq!(targets.len(), 8);
        assert!(targets.contains(&contacts[20]));

        let answers = targets
            .iter()
            .map(|data| (data.id, Some(Reply::Contacts(vec![own_contact(&own_id)]))))
            .collect();
        match lookup.evaluate(answers, &own_id) {
            Step::Contacts(ret) => {
                assert_eq!(ret.len(), 14);
                assert!(!ret.iter().any(|data| data.id == own_id));
            },
            step => panic!("unexpected step {:?}", step),
        }
    }

    fn own_contact(own_id: &Key) -> Contact {
        contact(*own_id)
    }

    #[test]
    fn test_failed_contacts_are_not_requeried() {
        let own_id = Key::rand();
        let key = Key::rand();
        let contacts = sorted_contacts(&key, 3);
        let mut lookup = Lookup::new(key, LookupKind::FindNode, contacts[1..].to_vec(), 3, 20);
        lookup.next_targets();

        let answers = vec![
            (contacts[1].id, None),
            (contacts[2].id, Some(Reply::Contacts(vec![contacts[0].clone()]))),
        ];
        assert_eq!(lookup.evaluate(answers, &own_id), Step::Continue);

        // the timed out contact is offered again but stays out
        lookup.next_targets();
        let answers = vec![(
            contacts[0].id,
            Some(Reply::Contacts(vec![contacts[1].clone(), contacts[2].clone()])),
        )];
        match lookup.evaluate(answers, &own_id) {
            Step::Contacts(ret) => assert_eq!(ret, vec![contacts[0].clone(), contacts[2].clone()]),
            step => panic!("unexpected step {:?}", step),
        }
    }

    #[test]
    fn test_value_found() {
        let own_id = Key::rand();
        let key = Key::rand();
        let contacts = sorted_contacts(&key, 3);
        let mut lookup = Lookup::new(key, LookupKind::FindValue, contacts.clone(), 3, 20);
        lookup.next_targets();

        let answers = vec![
            (contacts[0].id, Some(Reply::Value("cool".to_string()))),
            (contacts[1].id, None),
            (contacts[2].id, Some(Reply::Contacts(Vec::new()))),
        ];
        match lookup.evaluate(answers, &own_id) {
            Step::Value(value, cache_target) => {
                assert_eq!(value, "cool");
                assert_eq!(cache_target, Some(contacts[2].clone()));
            },
            step => panic!("unexpected step {:?}", step),
        }
    }

    #[test]
    fn test_value_found_without_cache_target() {
        let own_id = Key::rand();
        let key = Key::rand();
        let contacts = sorted_contacts(&key, 1);
        let mut lookup = Lookup::new(key, LookupKind::FindValue, contacts.clone(), 3, 20);
        lookup.next_targets();

        let answers = vec![(contacts[0].id, Some(Reply::Value("cool".to_string())))];
        assert_eq!(
            lookup.evaluate(answers, &own_id),
            Step::Value("cool".to_string(), None)
        );
    }

    #[test]
    fn test_value_answering_node_lookup_is_dropped() {
        let own_id = Key::rand();
        let key = Key::rand();
        let contacts = sorted_contacts(&key, 3);
        let mut lookup = Lookup::new(key, LookupKind::FindNode, contacts[..2].to_vec(), 3, 20);
        lookup.next_targets();

        let answers = vec![
            (contacts[0].id, Some(Reply::Value("junk".to_string()))),
            (contacts[1].id, Some(Reply::Contacts(vec![contacts[2].clone()]))),
        ];
        assert_eq!(lookup.evaluate(answers, &own_id), Step::Continue);
        assert_eq!(lookup.next_targets(), vec![contacts[2].clone()]);

        let answers = vec![(contacts[2].id, Some(Reply::Contacts(vec![contacts[0].clone()])))];
        match lookup.evaluate(answers, &own_id) {
            Step::Contacts(ret) => assert_eq!(ret, contacts[1..].to_vec()),
            step => panic!("unexpected step {:?}", step),
        }
    }

    #[test]
    fn test_shortlist_is_capped_at_k() {
        let own_id = Key::rand();
        let key = Key::rand();
        let contacts = sorted_contacts(&key, 12);
        let mut lookup = Lookup::new(key, LookupKind::FindNode, contacts[8..].to_vec(), 2, 4);

        // every answer repeats the same contacts, so the shortlist has to dedupe and trim them
        let targets = lookup.next_targets();
        assert_eq!(targets.len(), 2);
        let answers = targets
            .iter()
            .map(|data| (data.id, Some(Reply::Contacts(contacts[..8].to_vec()))))
            .collect();
        assert_eq!(lookup.evaluate(answers, &own_id), Step::Continue);

        let targets = lookup.next_targets();
        assert_eq!(targets, contacts[..2].to_vec());
        let answers = targets
            .iter()
            .map(|data| (data.id, Some(Reply::Contacts(contacts.clone()))))
            .collect();
        assert_eq!(lookup.evaluate(answers, &own_id), Step::Continue);

        // the closest contact did not change, so the rest of the shortlist is swept
        let targets = lookup.next_targets();
        assert_eq!(targets, contacts[2..4].to_vec());
        let answers = targets
            .iter()
            .map(|data| (data.id, Some(Reply::Contacts(contacts.clone()))))
            .collect();
        match lookup.evaluate(answers, &own_id) {
            Step::Contacts(ret) => assert_eq!(ret, contacts[..4].to_vec()),
            step => panic!("unexpected step {:?}", step),
        }
    }
}
