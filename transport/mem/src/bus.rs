use micro_rpc_core::error::RpcIntErr;
use micro_rpc_core::header::{Headers, NO_RESPONDERS_STATUS, STATUS};
use micro_rpc_core::transport::{Message, Subscription, Transport, Unsubscribe};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

struct SubEntry {
    tokens: Vec<String>,
    queue: Option<String>,
    tx: crossfire::MTx<Message>,
}

struct BusInner {
    subs: RwLock<BTreeMap<u64, SubEntry>>,
    next_sid: AtomicU64,
    next_inbox: AtomicU64,
    round_robin: AtomicUsize,
    closed: AtomicBool,
    inbox_prefix: String,
}

impl Unsubscribe for BusInner {
    #[inline]
    fn unsubscribe(&self, sid: u64) {
        if self.subs.write().unwrap().remove(&sid).is_some() {
            trace!("mem bus: sid {} unsubscribed", sid);
        }
    }
}

impl BusInner {
    /// Returns how many subscribers received the message.
    fn deliver(&self, msg: &Message) -> usize {
        let subject: Vec<&str> = msg.subject.split('.').collect();
        let subs = self.subs.read().unwrap();
        let mut delivered = 0;
        let mut groups: BTreeMap<&str, Vec<&SubEntry>> = BTreeMap::new();
        for entry in subs.values() {
            if !subject_matches(&entry.tokens, &subject) {
                continue;
            }
            match entry.queue.as_deref() {
                Some(q) => groups.entry(q).or_default().push(entry),
                None => {
                    if entry.tx.send(msg.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        for (_, members) in groups {
            let pick = self.round_robin.fetch_add(1, Ordering::Relaxed) % members.len();
            if members[pick].tx.send(msg.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Match a subject against a subscription pattern. `*` matches exactly one token, a trailing `>`
/// matches one or more.
pub fn subject_matches<S: AsRef<str>>(pattern: &[S], subject: &[&str]) -> bool {
    let mut i = 0;
    for p in pattern {
        let p = p.as_ref();
        if p == ">" {
            return subject.len() > i;
        }
        match subject.get(i) {
            None => return false,
            Some(s) => {
                if p != "*" && p != *s {
                    return false;
                }
            }
        }
        i += 1;
    }
    i == subject.len()
}

fn valid_subject(subject: &str, allow_wildcards: bool) -> bool {
    if subject.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, t) in tokens.iter().enumerate() {
        if t.is_empty() || t.chars().any(char::is_whitespace) {
            return false;
        }
        if *t == "*" || *t == ">" {
            if !allow_wildcards || (*t == ">" && i != tokens.len() - 1) {
                return false;
            }
        }
    }
    true
}

/// A message bus living inside the process.
///
/// Publishing with a reply subject to a subject nobody listens on delivers a status `503`
/// message to the reply subject, the same way a broker reports no responders.
#[derive(Clone)]
pub struct MemBus {
    inner: Arc<BusInner>,
}

impl Default for MemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBus {
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            inner: Arc::new(BusInner {
                subs: RwLock::new(BTreeMap::new()),
                next_sid: AtomicU64::new(1),
                next_inbox: AtomicU64::new(1),
                round_robin: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                inbox_prefix: format!("_INBOX.{}", &id[..12]),
            }),
        }
    }

    /// Number of live subscriptions, inboxes included.
    #[inline]
    pub fn subscription_count(&self) -> usize {
        self.inner.subs.read().unwrap().len()
    }

    /// Simulate losing the connection: every subscription ends and further calls fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let dropped = std::mem::take(&mut *self.inner.subs.write().unwrap());
        debug!("mem bus closed, dropped {} subscriptions", dropped.len());
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl Transport for MemBus {
    async fn publish(&self, msg: Message) -> Result<(), RpcIntErr> {
        if self.is_closed() {
            return Err(RpcIntErr::Closed);
        }
        if !valid_subject(&msg.subject, false) {
            warn!("mem bus: publish to invalid subject {:?}", msg.subject);
            return Err(RpcIntErr::IO);
        }
        let delivered = self.inner.deliver(&msg);
        trace!("mem bus: {:?} delivered to {}", msg, delivered);
        if delivered == 0 {
            if let Some(reply) = msg.reply {
                let mut headers = Headers::new();
                headers.insert(STATUS, NO_RESPONDERS_STATUS);
                self.inner.deliver(&Message::new(reply, Vec::new()).with_headers(headers));
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self, subject: &str, queue_group: Option<&str>,
    ) -> Result<Subscription, RpcIntErr> {
        if self.is_closed() {
            return Err(RpcIntErr::Closed);
        }
        if !valid_subject(subject, true) {
            warn!("mem bus: subscribe to invalid subject {:?}", subject);
            return Err(RpcIntErr::IO);
        }
        let (tx, rx) = crossfire::mpmc::unbounded_async::<Message>();
        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        let entry = SubEntry {
            tokens: subject.split('.').map(|s| s.to_string()).collect(),
            queue: queue_group.map(|q| q.to_string()),
            tx,
        };
        self.inner.subs.write().unwrap().insert(sid, entry);
        trace!("mem bus: sid {} subscribed {} queue={:?}", sid, subject, queue_group);
        Ok(Subscription::new(sid, subject.to_string(), rx, self.inner.clone()))
    }

    fn new_inbox(&self) -> String {
        let n = self.inner.next_inbox.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", self.inner.inbox_prefix, n)
    }
}
