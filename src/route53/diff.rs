//! Computes the libvirt `networkUpdate` operations needed to move the
//! network's DNS record set from one table to another.
//!
//! A/AAAA changes are host-block operations keyed by IP (libvirt groups
//! hostnames under a `<host ip="...">` element, not under a per-name
//! element), so they're collected separately from the per-record TXT/SRV
//! operations and emitted last. NS is carried as a side-channel TXT
//! record (see [`crate::libvirt::objects::ns_txt_name`]).

use std::collections::{BTreeMap, BTreeSet};

use virt::sys;

use crate::libvirt::objects::{join_ns_value, ns_txt_name, RecordTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOp {
    pub command: u32,
    pub section: u32,
    pub xml: String,
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('\'', "&apos;").replace('<', "&lt;").replace('>', "&gt;")
}

fn txt_xml(name: &str, value: &str) -> String {
    format!("<txt name='{}' value='{}'/>", escape_attr(name), escape_attr(value))
}

fn parse_srv_name(name: &str) -> Option<(String, String, Option<String>)> {
    let rest = name.strip_prefix('_')?;
    let mut parts = rest.splitn(2, "._");
    let service = parts.next()?.to_string();
    let proto_and_domain = parts.next()?;
    let mut it = proto_and_domain.splitn(2, '.');
    let protocol = it.next()?.to_string();
    let domain = it.next().filter(|d| !d.is_empty()).map(str::to_string);
    Some((service, protocol, domain))
}

fn srv_xml(name: &str, value: &str) -> String {
    let mut fields = value.split_whitespace();
    let priority = fields.next().unwrap_or("0");
    let weight = fields.next().unwrap_or("0");
    let port = fields.next().unwrap_or("0");
    let target = fields.next().unwrap_or(".");
    match parse_srv_name(name) {
        Some((service, protocol, Some(domain))) => format!(
            "<srv service='{service}' protocol='{protocol}' domain='{}' priority='{priority}' weight='{weight}' port='{port}' target='{}'/>",
            escape_attr(&domain), escape_attr(target),
        ),
        Some((service, protocol, None)) => format!(
            "<srv service='{service}' protocol='{protocol}' priority='{priority}' weight='{weight}' port='{port}' target='{}'/>",
            escape_attr(target),
        ),
        None => format!("<srv service='unknown' protocol='tcp' priority='{priority}' weight='{weight}' port='{port}' target='{}'/>", escape_attr(target)),
    }
}

/// Compares `current` (what the libvirt network XML holds today) against
/// `desired` (the table computed from a change batch, with any CNAME
/// entries already resolved to A). Returns `(deletes, adds)`; apply
/// deletes before adds, matching the ordering guarantee.
pub fn diff(current: &RecordTable, desired: &RecordTable) -> (Vec<NetworkOp>, Vec<NetworkOp>) {
    let mut deletes = Vec::new();
    let mut adds = Vec::new();

    let mut del_host_ips: BTreeSet<String> = BTreeSet::new();
    let mut add_hosts: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let mut keys: BTreeSet<(String, String)> = current.keys().cloned().collect();
    keys.extend(desired.keys().cloned());

    for key @ (typ, name) in &keys {
        let old = current.get(key);
        let new = desired.get(key);
        if old == new {
            continue;
        }

        match typ.as_str() {
            "A" | "AAAA" => {
                if let Some(ips) = old {
                    del_host_ips.extend(ips.iter().cloned());
                }
                if let Some(ips) = new {
                    for ip in ips {
                        add_hosts.entry(ip.clone()).or_default().push(name.clone());
                    }
                }
            }
            "TXT" => {
                for v in old.into_iter().flatten() {
                    deletes.push(NetworkOp {
                        command: sys::VIR_NETWORK_UPDATE_COMMAND_DELETE,
                        section: sys::VIR_NETWORK_SECTION_DNS_TXT,
                        xml: txt_xml(name, v),
                    });
                }
                for v in new.into_iter().flatten() {
                    adds.push(NetworkOp {
                        command: sys::VIR_NETWORK_UPDATE_COMMAND_ADD_LAST,
                        section: sys::VIR_NETWORK_SECTION_DNS_TXT,
                        xml: txt_xml(name, v),
                    });
                }
            }
            "NS" => {
                if let Some(targets) = old {
                    deletes.push(NetworkOp {
                        command: sys::VIR_NETWORK_UPDATE_COMMAND_DELETE,
                        section: sys::VIR_NETWORK_SECTION_DNS_TXT,
                        xml: txt_xml(&ns_txt_name(name), &join_ns_value(targets)),
                    });
                }
                if let Some(targets) = new {
                    adds.push(NetworkOp {
                        command: sys::VIR_NETWORK_UPDATE_COMMAND_ADD_LAST,
                        section: sys::VIR_NETWORK_SECTION_DNS_TXT,
                        xml: txt_xml(&ns_txt_name(name), &join_ns_value(targets)),
                    });
                }
            }
            "SRV" => {
                for v in old.into_iter().flatten() {
                    deletes.push(NetworkOp {
                        command: sys::VIR_NETWORK_UPDATE_COMMAND_DELETE,
                        section: sys::VIR_NETWORK_SECTION_DNS_SRV,
                        xml: srv_xml(name, v),
                    });
                }
                for v in new.into_iter().flatten() {
                    adds.push(NetworkOp {
                        command: sys::VIR_NETWORK_UPDATE_COMMAND_ADD_LAST,
                        section: sys::VIR_NETWORK_SECTION_DNS_SRV,
                        xml: srv_xml(name, v),
                    });
                }
            }
            _ => {}
        }
    }

    for ip in del_host_ips {
        deletes.push(NetworkOp {
            command: sys::VIR_NETWORK_UPDATE_COMMAND_DELETE,
            section: sys::VIR_NETWORK_SECTION_DNS_HOST,
            xml: format!("<host ip='{}'/>", escape_attr(&ip)),
        });
    }
    for (ip, names) in add_hosts {
        let hostnames: String = names.iter().map(|n| format!("<hostname>{}</hostname>", escape_attr(n))).collect();
        adds.push(NetworkOp {
            command: sys::VIR_NETWORK_UPDATE_COMMAND_ADD_LAST,
            section: sys::VIR_NETWORK_SECTION_DNS_HOST,
            xml: format!("<host ip='{}'>{hostnames}</host>", escape_attr(&ip)),
        });
    }

    (deletes, adds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, &str, &[&str])]) -> RecordTable {
        entries
            .iter()
            .map(|(t, n, v)| ((t.to_string(), n.to_string()), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn new_a_record_emits_single_host_add() {
        let current = table(&[]);
        let desired = table(&[("A", "www.example.local.", &["1.2.3.4"])]);
        let (deletes, adds) = diff(&current, &desired);
        assert!(deletes.is_empty());
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].section, sys::VIR_NETWORK_SECTION_DNS_HOST);
        assert!(adds[0].xml.contains("1.2.3.4"));
        assert!(adds[0].xml.contains("www.example.local."));
    }

    #[test]
    fn removed_a_record_emits_host_delete_by_ip() {
        let current = table(&[("A", "www.example.local.", &["1.2.3.4"])]);
        let desired = table(&[]);
        let (deletes, adds) = diff(&current, &desired);
        assert!(adds.is_empty());
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].xml, "<host ip='1.2.3.4'/>");
    }

    #[test]
    fn new_txt_value_emits_add_only() {
        let current = table(&[]);
        let desired = table(&[("TXT", "_verify.example.local.", &["abc"])]);
        let (deletes, adds) = diff(&current, &desired);
        assert!(deletes.is_empty());
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].section, sys::VIR_NETWORK_SECTION_DNS_TXT);
    }

    #[test]
    fn unchanged_keys_produce_no_ops() {
        let current = table(&[("TXT", "x.example.local.", &["v"])]);
        let desired = table(&[("TXT", "x.example.local.", &["v"])]);
        let (deletes, adds) = diff(&current, &desired);
        assert!(deletes.is_empty() && adds.is_empty());
    }

    #[test]
    fn srv_name_round_trips_through_xml() {
        let current = table(&[]);
        let desired = table(&[("SRV", "_ldap._tcp", &["0 0 389 ldap.example.local."])]);
        let (_, adds) = diff(&current, &desired);
        assert_eq!(adds.len(), 1);
        assert!(adds[0].xml.contains("service='ldap'"));
        assert!(adds[0].xml.contains("port='389'"));
    }
}
