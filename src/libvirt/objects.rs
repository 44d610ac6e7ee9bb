//! Typed, read-through views over libvirt XML definitions.
//!
//! Every view is constructed from an XML string and is immutable
//! afterwards; callers that need a fresh view re-fetch the XML from
//! libvirt and construct a new one. Parsing goes through `quick-xml`'s
//! pull `Reader` rather than a generic struct mapping, because each view
//! only needs a handful of fields and the schema has list-or-single
//! ambiguity that a derive-based mapper would fight rather than help with.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{ApiError, ApiResult};

/// A domain (VM) definition: name plus its volume-backed disks.
#[derive(Debug, Clone)]
pub struct Domain {
    pub name: String,
    pub disks: Vec<DiskDevice>,
}

#[derive(Debug, Clone)]
pub struct DiskDevice {
    pub pool: String,
    pub volume: String,
    pub device: String,
}

impl Domain {
    pub fn from_xml(xml: &str) -> ApiResult<Domain> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut name = None;
        let mut disks = Vec::new();
        let mut in_name = false;
        let mut in_volume_disk = false;
        let mut cur_pool: Option<String> = None;
        let mut cur_volume: Option<String> = None;
        let mut cur_target: Option<String> = None;
        let mut depth_in_name_tag = false;

        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf).map_err(ApiError::internal)? {
                Event::Eof => break,
                Event::Start(e) => match e.local_name().as_ref() {
                    b"name" if name.is_none() => {
                        in_name = true;
                        depth_in_name_tag = true;
                    }
                    b"disk" => {
                        let is_volume = e
                            .attributes()
                            .flatten()
                            .any(|a| a.key.local_name().as_ref() == b"type" && &*a.value == b"volume");
                        in_volume_disk = is_volume;
                        cur_pool = None;
                        cur_volume = None;
                        cur_target = None;
                    }
                    b"source" if in_volume_disk => {
                        for attr in e.attributes().flatten() {
                            match attr.key.local_name().as_ref() {
                                b"pool" => cur_pool = Some(String::from_utf8_lossy(&attr.value).into_owned()),
                                b"volume" => cur_volume = Some(String::from_utf8_lossy(&attr.value).into_owned()),
                                _ => {}
                            }
                        }
                    }
                    b"target" if in_volume_disk => {
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"dev" {
                                cur_target = Some(String::from_utf8_lossy(&attr.value).into_owned());
                            }
                        }
                    }
                    _ => {}
                },
                Event::Text(t) if in_name && depth_in_name_tag => {
                    name = Some(t.unescape().map_err(ApiError::internal)?.into_owned());
                    in_name = false;
                }
                Event::End(e) => {
                    if e.local_name().as_ref() == b"disk" && in_volume_disk {
                        if let (Some(pool), Some(volume), Some(device)) =
                            (cur_pool.take(), cur_volume.take(), cur_target.take())
                        {
                            disks.push(DiskDevice { pool, volume, device });
                        }
                        in_volume_disk = false;
                    }
                }
                _ => {}
            }
            buf.clear();
        }

        Ok(Domain {
            name: name.ok_or_else(|| ApiError::internal("domain xml missing <name>"))?,
            disks,
        })
    }
}

/// A storage volume definition.
#[derive(Debug, Clone)]
pub struct Volume {
    pub name: String,
    pub capacity_bytes: u64,
    pub target_path: Option<String>,
    pub backing_store: Option<String>,
}

impl Volume {
    pub fn from_xml(xml: &str) -> ApiResult<Volume> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut name = None;
        let mut capacity = None;
        let mut target_path = None;
        let mut backing_store = None;

        let mut stack: Vec<Vec<u8>> = Vec::new();
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf).map_err(ApiError::internal)? {
                Event::Eof => break,
                Event::Start(e) => stack.push(e.local_name().as_ref().to_vec()),
                Event::Empty(_) => {}
                Event::Text(t) => {
                    let text = t.unescape().map_err(ApiError::internal)?.into_owned();
                    match stack.last().map(|v| v.as_slice()) {
                        Some(b"name") if stack.len() == 2 => name = Some(text),
                        Some(b"capacity") => capacity = text.trim().parse::<u64>().ok(),
                        Some(b"path") => {
                            let parent = stack.get(stack.len().wrapping_sub(2)).map(|v| v.as_slice());
                            match parent {
                                Some(b"target") => target_path = Some(text),
                                Some(b"backingStore") => backing_store = Some(text),
                                _ => {}
                            }
                        }
                        _ => {}
                    }
                }
                Event::End(_) => {
                    stack.pop();
                }
                _ => {}
            }
            buf.clear();
        }

        Ok(Volume {
            name: name.ok_or_else(|| ApiError::internal("volume xml missing <name>"))?,
            capacity_bytes: capacity.ok_or_else(|| ApiError::internal("volume xml missing <capacity>"))?,
            target_path,
            backing_store,
        })
    }
}

/// A single DNS record value set, keyed by `(type, name)`.
pub type RecordKey = (String, String);
pub type RecordTable = BTreeMap<RecordKey, Vec<String>>;

/// A libvirt network definition: IPv4 block, DNS domain, and computed
/// DNS record set.
#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    pub dns_domain: Option<String>,
    pub ipv4_network: Option<(Ipv4Addr, u8)>,
    pub dhcp_range_start: Option<Ipv4Addr>,
    pub records: RecordTable,
}

impl Network {
    pub fn from_xml(xml: &str) -> ApiResult<Network> {
        let doc = parse_network_xml(xml)?;
        Ok(doc)
    }

    /// Static address range: from the first usable host address of the
    /// network block up to (but excluding) the start of the DHCP range.
    pub fn static_ip_range(&self) -> ApiResult<(Ipv4Addr, Ipv4Addr)> {
        let (addr, prefix) = self
            .ipv4_network
            .ok_or_else(|| ApiError::internal("network does not define an IP block"))?;
        let dhcp_start = self
            .dhcp_range_start
            .ok_or_else(|| ApiError::internal("network does not define a DHCP range"))?;

        let base = u32::from(addr) & (!0u32 << (32 - prefix));
        let first_host = base + 2; // skip network address and gateway (.0 and .1)
        Ok((Ipv4Addr::from(first_host), dhcp_start))
    }

    /// Records belonging to `zone` (the primary domain, or a sub-zone
    /// name), excluding anything that also lies in a more specific
    /// sub-zone from `sub_zones`.
    pub fn records_for_zone<'a>(&'a self, zone: &str, sub_zones: &[&str]) -> Vec<(&'a RecordKey, &'a Vec<String>)> {
        let zone = zone.trim_end_matches('.');
        self.records
            .iter()
            .filter(|((_, name), _)| {
                let name = name.trim_end_matches('.');
                let in_zone = name.ends_with(zone) || name == zone;
                let in_narrower_subzone = sub_zones
                    .iter()
                    .map(|sz| sz.trim_end_matches('.'))
                    .filter(|sz| *sz != zone)
                    .any(|sz| name.ends_with(sz) || name == sz);
                in_zone && !in_narrower_subzone
            })
            .collect()
    }
}

fn split_ns_value(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub(crate) fn join_ns_value(targets: &[String]) -> String {
    let mut sorted: Vec<&String> = targets.iter().collect();
    sorted.sort();
    sorted.iter().map(|t| format!("\"{t}\"")).collect::<Vec<_>>().join(",")
}

/// NS values are carried as a side-channel TXT record whose name begins
/// with `@@ns.`; this helper round-trips that encoding.
pub fn ns_txt_name(stripped_name: &str) -> String {
    format!("@@ns.{stripped_name}")
}

#[allow(clippy::too_many_arguments)]
fn apply_network_element(
    local: &[u8],
    e: &quick_xml::events::BytesStart,
    domain: &mut Option<String>,
    ipv4: &mut Option<(Ipv4Addr, u8)>,
    dhcp_start: &mut Option<Ipv4Addr>,
    pending_host_ip: &mut Option<String>,
    records: &mut RecordTable,
) {
    match local {
        b"domain" => {
            for attr in e.attributes().flatten() {
                if attr.key.local_name().as_ref() == b"name" {
                    let mut d = String::from_utf8_lossy(&attr.value).into_owned();
                    if !d.ends_with('.') {
                        d.push('.');
                    }
                    *domain = Some(d);
                }
            }
        }
        b"ip" => {
            let mut family_ipv4 = true;
            let mut address = None;
            let mut prefix = None;
            for attr in e.attributes().flatten() {
                match attr.key.local_name().as_ref() {
                    b"family" => family_ipv4 = &*attr.value != b"ipv6",
                    b"address" => address = String::from_utf8_lossy(&attr.value).parse::<Ipv4Addr>().ok(),
                    b"prefix" => prefix = String::from_utf8_lossy(&attr.value).parse::<u8>().ok(),
                    b"netmask" => {
                        if let Ok(mask) = String::from_utf8_lossy(&attr.value).parse::<Ipv4Addr>() {
                            prefix = Some(u32::from(mask).count_ones() as u8);
                        }
                    }
                    _ => {}
                }
            }
            if family_ipv4 {
                if let (Some(a), Some(p)) = (address, prefix) {
                    *ipv4 = Some((a, p));
                }
            }
        }
        b"range" => {
            for attr in e.attributes().flatten() {
                if attr.key.local_name().as_ref() == b"start" {
                    *dhcp_start = String::from_utf8_lossy(&attr.value).parse().ok();
                }
            }
        }
        b"host" => {
            let mut ip = None;
            for attr in e.attributes().flatten() {
                if attr.key.local_name().as_ref() == b"ip" {
                    ip = Some(String::from_utf8_lossy(&attr.value).into_owned());
                }
            }
            // hostnames come from nested <hostname> text events, matched
            // against this pending ip while we're inside the <host> element.
            if let Some(ip) = ip {
                *pending_host_ip = Some(ip);
            }
        }
        b"txt" => {
            let mut rec_name = None;
            let mut value = None;
            for attr in e.attributes().flatten() {
                match attr.key.local_name().as_ref() {
                    b"name" => rec_name = Some(String::from_utf8_lossy(&attr.value).into_owned()),
                    b"value" => value = Some(String::from_utf8_lossy(&attr.value).into_owned()),
                    _ => {}
                }
            }
            if let (Some(n), Some(v)) = (rec_name, value) {
                if let Some(stripped) = n.strip_prefix("@@ns.") {
                    records.entry(("NS".to_string(), stripped.to_string())).or_default().extend(split_ns_value(&v));
                } else {
                    records.entry(("TXT".to_string(), n)).or_default().push(v);
                }
            }
        }
        b"srv" => {
            let mut service = None;
            let mut protocol = None;
            let mut domain_attr = None;
            let mut priority = "0".to_string();
            let mut weight = "0".to_string();
            let mut port = "0".to_string();
            let mut target = ".".to_string();
            for attr in e.attributes().flatten() {
                let v = String::from_utf8_lossy(&attr.value).into_owned();
                match attr.key.local_name().as_ref() {
                    b"service" => service = Some(v),
                    b"protocol" => protocol = Some(v),
                    b"domain" => domain_attr = Some(v),
                    b"priority" => priority = v,
                    b"weight" => weight = v,
                    b"port" => port = v,
                    b"target" => target = v,
                    _ => {}
                }
            }
            if let (Some(s), Some(p)) = (service, protocol) {
                let name = match domain_attr {
                    Some(d) => format!("_{s}._{p}.{d}"),
                    None => format!("_{s}._{p}"),
                };
                records.entry(("SRV".to_string(), name)).or_default().push(format!("{priority} {weight} {port} {target}"));
            }
        }
        _ => {}
    }
}

fn parse_network_xml(xml: &str) -> ApiResult<Network> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut name = None;
    let mut domain = None;
    let mut ipv4: Option<(Ipv4Addr, u8)> = None;
    let mut dhcp_start: Option<Ipv4Addr> = None;
    let mut records: RecordTable = BTreeMap::new();

    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut buf = Vec::new();
    let mut pending_host_ip: Option<String> = None;

    loop {
        let ev = reader.read_event_into(&mut buf).map_err(ApiError::internal)?;
        match ev {
            Event::Eof => break,
            Event::Start(e) => {
                let local = e.local_name().as_ref().to_vec();
                apply_network_element(&local, &e, &mut domain, &mut ipv4, &mut dhcp_start, &mut pending_host_ip, &mut records);
                stack.push(local);
            }
            Event::Empty(e) => {
                let local = e.local_name().as_ref().to_vec();
                apply_network_element(&local, &e, &mut domain, &mut ipv4, &mut dhcp_start, &mut pending_host_ip, &mut records);
            }
            Event::Text(t) => {
                if stack.last().map(|v| v.as_slice()) == Some(b"hostname") {
                    if let Some(ip) = pending_host_ip.clone() {
                        let hostname = t.unescape().map_err(ApiError::internal)?.into_owned();
                        let fqdn = if hostname.ends_with('.') { hostname } else { format!("{hostname}.") };
                        let record_type = if ip.contains(':') { "AAAA" } else { "A" };
                        records.entry((record_type.to_string(), fqdn)).or_default().push(ip);
                    }
                } else if stack.last().map(|v| v.as_slice()) == Some(b"name") && stack.len() == 2 && name.is_none() {
                    name = Some(t.unescape().map_err(ApiError::internal)?.into_owned());
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"host" {
                    pending_host_ip = None;
                }
                stack.pop();
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(Network {
        name: name.unwrap_or_default(),
        dns_domain: domain,
        ipv4_network: ipv4,
        dhcp_range_start: dhcp_start,
        records,
    })
}
