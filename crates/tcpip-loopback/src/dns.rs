//! Name resolution.
//!
//! Two tables answer lookups: the local host list (`localhost` plus
//! anything added with `add_local_host`) answers at once, the zone
//! (`add_host`) plays a remote server and answers on the next tick.
//! Positive zone answers are cached. Concurrent lookups of one name
//! share a single table entry.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use netconn_core::arena::Arena;
use netconn_core::error::{NetError, NetResult};
use netconn_core::kdebug;
use tcpip_core::{DnsHandler, IpFamily};

/// Longest name accepted for lookup
pub const DNS_MAX_NAME_LENGTH: usize = 255;

struct Query {
    name: String,
    family: IpFamily,
    handlers: Vec<Arc<dyn DnsHandler>>,
}

pub(crate) struct DnsTable {
    local: HashMap<String, Vec<IpAddr>>,
    zone: HashMap<String, Vec<IpAddr>>,
    cache: HashMap<String, Vec<IpAddr>>,
    pending: Arena<Query>,
    max_requests: usize,
}

/// First address of `addrs` usable for `family`, IPv4 preferred for `Any`.
fn pick(addrs: &[IpAddr], family: IpFamily) -> Option<IpAddr> {
    match family {
        IpFamily::Any => addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied(),
        fam => addrs.iter().find(|a| fam.admits(a)).copied(),
    }
}

impl DnsTable {
    pub fn new(table_size: usize, max_requests: usize) -> Self {
        let mut local = HashMap::new();
        local.insert(
            "localhost".to_string(),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)],
        );
        Self {
            local,
            zone: HashMap::new(),
            cache: HashMap::new(),
            pending: Arena::new(table_size.max(1)),
            max_requests: max_requests.max(1),
        }
    }

    pub fn add_local(&mut self, name: &str, addr: IpAddr) {
        self.local.entry(name.to_ascii_lowercase()).or_default().push(addr);
    }

    pub fn add_zone(&mut self, name: &str, addr: IpAddr) {
        self.zone.entry(name.to_ascii_lowercase()).or_default().push(addr);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn lookup(
        &mut self,
        name: &str,
        family: IpFamily,
        handler: Arc<dyn DnsHandler>,
    ) -> NetResult<Option<IpAddr>> {
        if name.is_empty() || name.len() > DNS_MAX_NAME_LENGTH {
            return Err(NetError::Arg);
        }
        if let Ok(addr) = name.parse::<IpAddr>() {
            return Ok(Some(addr));
        }
        let key = name.to_ascii_lowercase();
        for table in [&self.local, &self.cache] {
            if let Some(addr) = table.get(&key).and_then(|a| pick(a, family)) {
                return Ok(Some(addr));
            }
        }

        if let Some(idx) = self.pending.position(|q| q.name == key && q.family == family) {
            let max = self.max_requests;
            let query = self.pending.get_mut(idx).ok_or(NetError::Mem)?;
            if query.handlers.len() >= max {
                return Err(NetError::Mem);
            }
            query.handlers.push(handler);
            return Ok(None);
        }
        let query = Query { name: key, family, handlers: vec![handler] };
        match self.pending.alloc(query) {
            Ok(_) => Ok(None),
            Err(q) => {
                kdebug!("dns table full, dropping lookup of {}", q.name);
                Err(NetError::Mem)
            }
        }
    }

    /// Answer every outstanding query.
    pub fn tick(&mut self) {
        if self.pending() == 0 {
            return;
        }
        kdebug!("dns answering {} queries", self.pending());
        let done = self.pending.drain_filter(|_| true);
        for q in done {
            let addr = self.zone.get(&q.name).and_then(|a| pick(a, q.family));
            match addr {
                Some(a) => {
                    let cached = self.cache.entry(q.name.clone()).or_default();
                    if !cached.contains(&a) {
                        cached.push(a);
                    }
                    kdebug!("dns {} -> {}", q.name, a);
                }
                None => kdebug!("dns {} not found", q.name),
            }
            for h in &q.handlers {
                h.found(&q.name, addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Record(Mutex<Vec<(String, Option<IpAddr>)>>);

    impl DnsHandler for Record {
        fn found(&self, name: &str, addr: Option<IpAddr>) {
            self.0.lock().unwrap().push((name.to_string(), addr));
        }
    }

    #[test]
    fn test_literal_and_localhost() {
        let mut dns = DnsTable::new(4, 4);
        let h = Arc::new(Record::default());
        assert_eq!(
            dns.lookup("10.1.2.3", IpFamily::V4, h.clone()).unwrap(),
            Some("10.1.2.3".parse().unwrap())
        );
        assert_eq!(
            dns.lookup("LocalHost", IpFamily::V6, h.clone()).unwrap(),
            Some("::1".parse().unwrap())
        );
        assert_eq!(dns.lookup("", IpFamily::V4, h), Err(NetError::Arg));
    }

    #[test]
    fn test_concurrent_lookups_share_entry() {
        let mut dns = DnsTable::new(4, 2);
        dns.add_zone("db.internal", "10.0.0.7".parse().unwrap());
        let h = Arc::new(Record::default());

        assert_eq!(dns.lookup("db.internal", IpFamily::V4, h.clone()).unwrap(), None);
        assert_eq!(dns.lookup("db.internal", IpFamily::V4, h.clone()).unwrap(), None);
        assert_eq!(dns.pending(), 1);
        assert_eq!(dns.lookup("db.internal", IpFamily::V4, h.clone()), Err(NetError::Mem));

        dns.tick();
        let got = h.0.lock().unwrap().clone();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|(_, a)| *a == Some("10.0.0.7".parse().unwrap())));

        // cached now
        assert_eq!(
            dns.lookup("db.internal", IpFamily::V4, h).unwrap(),
            Some("10.0.0.7".parse().unwrap())
        );
    }

    #[test]
    fn test_cache_keeps_one_copy_per_address() {
        let mut dns = DnsTable::new(4, 4);
        dns.add_zone("cache.internal", "10.0.0.9".parse().unwrap());
        let h = Arc::new(Record::default());

        // two families, two entries, one answer
        assert_eq!(dns.lookup("cache.internal", IpFamily::V4, h.clone()).unwrap(), None);
        assert_eq!(dns.lookup("cache.internal", IpFamily::Any, h.clone()).unwrap(), None);
        assert_eq!(dns.pending(), 2);
        dns.tick();
        assert_eq!(dns.pending(), 0);
        assert_eq!(h.0.lock().unwrap().len(), 2);
        assert_eq!(dns.cache["cache.internal"], vec!["10.0.0.9".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_table_full_and_unknown() {
        let mut dns = DnsTable::new(1, 4);
        let h = Arc::new(Record::default());
        assert_eq!(dns.lookup("a.example", IpFamily::V4, h.clone()).unwrap(), None);
        assert_eq!(dns.lookup("b.example", IpFamily::V4, h.clone()), Err(NetError::Mem));
        dns.tick();
        assert_eq!(h.0.lock().unwrap()[0], ("a.example".to_string(), None));
    }
}
