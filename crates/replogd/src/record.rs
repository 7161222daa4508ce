//! Change records: one paragraph of the replication log.
//!
//! A record names the replicas it must reach, the time the producer logged
//! it, the target DN and the change itself. Records are parsed from and
//! written back to the LDIF-like replication log format.

use crate::error::ParseError;
use crate::ldif;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Port assumed when a replica is named without one.
pub const DEFAULT_PORT: u16 = 389;

/// Identity of a replica server: host plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId {
    /// Host name as it appears in the configuration.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ReplicaId {
    /// Create a new replica identity.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, defaulting the port to [`DEFAULT_PORT`].
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, "")) => (host, DEFAULT_PORT),
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ParseError::new(format!("bad replica port in {:?}", s)))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(ParseError::new(format!("empty replica host in {:?}", s)));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordering key of a record: producer timestamp plus tie-breaking sequence.
///
/// The derived ordering is lexicographic on (timestamp, sequence).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Stamp {
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    /// Tie-breaker among records sharing a timestamp.
    pub sequence: u32,
}

impl Stamp {
    /// Create a new stamp.
    pub fn new(timestamp: u64, sequence: u32) -> Self {
        Self {
            timestamp,
            sequence,
        }
    }

    /// The stamp immediately after this one at the same timestamp.
    pub fn next_in_second(self) -> Self {
        Self::new(self.timestamp, self.sequence.saturating_add(1))
    }

    /// Parse a `time:` value, `<seconds>[.<sequence>]`.
    pub fn parse(value: &str) -> Result<Self, ParseError> {
        let value = value.trim();
        let (secs, seq) = match value.split_once('.') {
            Some((secs, seq)) => (secs, Some(seq)),
            None => (value, None),
        };
        let timestamp = secs
            .parse::<u64>()
            .map_err(|_| ParseError::new(format!("unable to parse timestamp {:?}", value)))?;
        let sequence = match seq {
            Some(seq) if seq.starts_with(|c: char| c.is_ascii_digit()) => seq
                .parse::<u32>()
                .map_err(|_| ParseError::new(format!("unable to parse sequence number {:?}", seq)))?,
            _ => 0,
        };
        Ok(Self::new(timestamp, sequence))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.timestamp, self.sequence)
    }
}

/// Kind of directory change carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// New entry.
    Add,
    /// Attribute modifications on an existing entry.
    Modify,
    /// Entry removal.
    Delete,
    /// RDN change, optionally moving the entry.
    Rename,
}

impl ChangeKind {
    /// The `changetype:` keyword written to the log.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Modify => "modify",
            ChangeKind::Delete => "delete",
            ChangeKind::Rename => "modrdn",
        }
    }

    /// Interpret a `changetype:` keyword.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.trim().to_ascii_lowercase().as_str() {
            "add" => Some(ChangeKind::Add),
            "modify" => Some(ChangeKind::Modify),
            "delete" => Some(ChangeKind::Delete),
            "modrdn" | "moddn" | "rename" => Some(ChangeKind::Rename),
            _ => None,
        }
    }
}

/// Operation of one modify block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModOp {
    /// Add values.
    Add,
    /// Replace all values.
    Replace,
    /// Delete values, or the whole attribute when no values are given.
    Delete,
    /// Increment a numeric value.
    Increment,
}

impl ModOp {
    /// Keyword that opens the block.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModOp::Add => "add",
            ModOp::Replace => "replace",
            ModOp::Delete => "delete",
            ModOp::Increment => "increment",
        }
    }

    /// Interpret a block-opening keyword.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_lowercase().as_str() {
            "add" => Some(ModOp::Add),
            "replace" => Some(ModOp::Replace),
            "delete" => Some(ModOp::Delete),
            "increment" => Some(ModOp::Increment),
            _ => None,
        }
    }
}

/// One attribute value of an entry being added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    /// Attribute type.
    pub attr: String,
    /// Raw value bytes.
    pub value: Vec<u8>,
}

impl AttributeValue {
    /// Create a new attribute value.
    pub fn new(attr: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            attr: attr.into(),
            value: value.into(),
        }
    }
}

/// One modify block: operation, attribute and its values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// What to do with the attribute.
    pub op: ModOp,
    /// Attribute type.
    pub attr: String,
    /// Values, in log order.
    pub values: Vec<Vec<u8>>,
}

impl Modification {
    /// Create a modification without values.
    pub fn new(op: ModOp, attr: impl Into<String>) -> Self {
        Self {
            op,
            attr: attr.into(),
            values: Vec::new(),
        }
    }

    /// Builder-style helper appending one value.
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.values.push(value.into());
        self
    }
}

/// The change carried by a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// Add a new entry with these attributes, in log order.
    Add {
        /// Attributes of the new entry.
        attributes: Vec<AttributeValue>,
    },
    /// Apply modifications in log order.
    Modify {
        /// Ordered modify blocks.
        modifications: Vec<Modification>,
    },
    /// Delete the entry.
    Delete,
    /// Rename the entry.
    Rename {
        /// The new RDN.
        new_rdn: String,
        /// Whether the old RDN values are removed.
        delete_old_rdn: bool,
        /// New parent DN, if the entry moves.
        new_superior: Option<String>,
    },
}

impl Change {
    /// The kind of this change.
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Add { .. } => ChangeKind::Add,
            Change::Modify { .. } => ChangeKind::Modify,
            Change::Delete => ChangeKind::Delete,
            Change::Rename { .. } => ChangeKind::Rename,
        }
    }

    /// Write the lines following `changetype:` in the log format.
    pub fn write_body(&self, out: &mut String) {
        match self {
            Change::Add { attributes } => {
                for av in attributes {
                    ldif::put_value(out, &av.attr, &av.value);
                }
            }
            Change::Modify { modifications } => {
                for m in modifications {
                    ldif::put_value(out, m.op.as_str(), m.attr.as_bytes());
                    for value in &m.values {
                        ldif::put_value(out, &m.attr, value);
                    }
                    out.push_str("-\n");
                }
            }
            Change::Delete => {}
            Change::Rename {
                new_rdn,
                delete_old_rdn,
                new_superior,
            } => {
                ldif::put_value(out, "newrdn", new_rdn.as_bytes());
                ldif::put_folded(
                    out,
                    &format!("deleteoldrdn: {}", if *delete_old_rdn { 1 } else { 0 }),
                );
                if let Some(sup) = new_superior {
                    ldif::put_value(out, "newsuperior", sup.as_bytes());
                }
            }
        }
    }
}

/// One parsed unit of replicated work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Replicas this record must be applied to, in log order, without duplicates.
    pub targets: Vec<ReplicaId>,
    /// Timestamp and sequence.
    pub stamp: Stamp,
    /// DN of the changed entry.
    pub dn: String,
    /// The change itself.
    pub change: Change,
}

impl ChangeRecord {
    /// Create a record.
    pub fn new(targets: Vec<ReplicaId>, stamp: Stamp, dn: impl Into<String>, change: Change) -> Self {
        Self {
            targets,
            stamp,
            dn: dn.into(),
            change,
        }
    }

    /// Kind of change.
    pub fn kind(&self) -> ChangeKind {
        self.change.kind()
    }

    /// Whether `replica` is one of this record's targets.
    pub fn is_for(&self, replica: &ReplicaId) -> bool {
        self.targets.iter().any(|t| t == replica)
    }

    /// Parse one record paragraph.
    ///
    /// Every `replica:` line is kept; filtering against the configured
    /// replica set is the queue's job.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let lines = ldif::logical_lines(text);
        let mut pos = 0;

        // Reject files prefix each record with an ERROR line.
        while pos < lines.len() && lines[pos].starts_with("ERROR") {
            pos += 1;
        }

        let mut targets: Vec<ReplicaId> = Vec::new();
        while pos < lines.len() && has_type(&lines[pos], "replica") {
            let (attr, value) = ldif::parse_line(&lines[pos])?;
            let replica = ReplicaId::parse(&ldif::value_to_string(&attr, value)?)?;
            if !targets.contains(&replica) {
                targets.push(replica);
            }
            pos += 1;
        }

        let mut stamp = None;
        let mut dn = None;
        let mut kind = None;
        while stamp.is_none() || dn.is_none() || kind.is_none() {
            let line = lines.get(pos).ok_or_else(|| {
                ParseError::new(format!(
                    "missing {}",
                    if stamp.is_none() {
                        "time"
                    } else if dn.is_none() {
                        "dn"
                    } else {
                        "changetype"
                    }
                ))
            })?;
            pos += 1;
            let (attr, value) = ldif::parse_line(line)?;
            match attr.to_ascii_lowercase().as_str() {
                "time" => {
                    if stamp.is_some() {
                        return Err(ParseError::new("duplicate time line"));
                    }
                    stamp = Some(Stamp::parse(&ldif::value_to_string(&attr, value)?)?);
                }
                "dn" => {
                    if dn.is_some() {
                        return Err(ParseError::new("duplicate dn line"));
                    }
                    dn = Some(ldif::value_to_string(&attr, value)?);
                }
                "changetype" => {
                    if kind.is_some() {
                        return Err(ParseError::new("duplicate changetype line"));
                    }
                    let keyword = ldif::value_to_string(&attr, value)?;
                    kind = Some(ChangeKind::from_keyword(&keyword).ok_or_else(|| {
                        ParseError::new(format!("unknown changetype {:?}", keyword))
                    })?);
                }
                _ => return Err(ParseError::new(format!("bad type {:?}", attr))),
            }
        }

        let body = &lines[pos..];
        let change = match kind {
            Some(ChangeKind::Add) => parse_add(body)?,
            Some(ChangeKind::Modify) => parse_modify(body)?,
            Some(ChangeKind::Delete) => {
                if let Some(extra) = body.first() {
                    return Err(ParseError::new(format!(
                        "unexpected line after delete: {:?}",
                        extra
                    )));
                }
                Change::Delete
            }
            Some(ChangeKind::Rename) => parse_rename(body)?,
            None => return Err(ParseError::new("missing changetype")),
        };

        Ok(Self {
            targets,
            stamp: stamp.unwrap_or_default(),
            dn: dn.unwrap_or_default(),
            change,
        })
    }

    /// Serialize the record with every target replica, blank-line terminated.
    pub fn to_ldif(&self) -> String {
        let mut out = String::new();
        self.write_ldif(&mut out, None);
        out
    }

    /// Serialize the record with a single `replica:` line, as reject files do.
    pub fn to_ldif_for(&self, replica: &ReplicaId) -> String {
        let mut out = String::new();
        self.write_ldif(&mut out, Some(replica));
        out
    }

    fn write_ldif(&self, out: &mut String, only: Option<&ReplicaId>) {
        match only {
            Some(replica) => ldif::put_folded(out, &format!("replica: {}", replica)),
            None => {
                for replica in &self.targets {
                    ldif::put_folded(out, &format!("replica: {}", replica));
                }
            }
        }
        ldif::put_folded(out, &format!("time: {}", self.stamp));
        ldif::put_value(out, "dn", self.dn.as_bytes());
        ldif::put_folded(out, &format!("changetype: {}", self.kind().as_str()));
        self.change.write_body(out);
        out.push('\n');
    }
}

fn has_type(line: &str, attr: &str) -> bool {
    line.get(..attr.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(attr))
        && line.as_bytes().get(attr.len()) == Some(&b':')
}

fn parse_add(body: &[String]) -> Result<Change, ParseError> {
    let mut attributes = Vec::with_capacity(body.len());
    for line in body {
        if line == "-" {
            return Err(ParseError::new("separator line in add record"));
        }
        let (attr, value) = ldif::parse_line(line)?;
        attributes.push(AttributeValue { attr, value });
    }
    if attributes.is_empty() {
        return Err(ParseError::new("add record without attributes"));
    }
    Ok(Change::Add { attributes })
}

fn parse_modify(body: &[String]) -> Result<Change, ParseError> {
    let mut modifications = Vec::new();
    let mut open: Option<Modification> = None;
    for line in body {
        if line == "-" {
            if let Some(m) = open.take() {
                modifications.push(m);
            }
            continue;
        }
        let (attr, value) = ldif::parse_line(line)?;
        match open.as_mut() {
            None => {
                let op = ModOp::from_keyword(&attr).ok_or_else(|| {
                    ParseError::new(format!("value line for {:?} without an open modification", attr))
                })?;
                open = Some(Modification::new(op, ldif::value_to_string(&attr, value)?));
            }
            Some(m) if m.attr.eq_ignore_ascii_case(&attr) => m.values.push(value),
            Some(m) => {
                return Err(ParseError::new(format!(
                    "value line for {:?} inside modification of {:?}",
                    attr, m.attr
                )))
            }
        }
    }
    if let Some(m) = open {
        modifications.push(m);
    }
    Ok(Change::Modify { modifications })
}

fn parse_rename(body: &[String]) -> Result<Change, ParseError> {
    let mut new_rdn = None;
    let mut delete_old_rdn = None;
    let mut new_superior = None;
    for line in body {
        let (attr, value) = ldif::parse_line(line)?;
        match attr.to_ascii_lowercase().as_str() {
            "newrdn" => {
                if new_rdn.is_some() {
                    return Err(ParseError::new("multiple newrdn arguments"));
                }
                new_rdn = Some(ldif::value_to_string(&attr, value)?);
            }
            "deleteoldrdn" => {
                if delete_old_rdn.is_some() {
                    return Err(ParseError::new("multiple deleteoldrdn arguments"));
                }
                delete_old_rdn = Some(match value.as_slice() {
                    b"0" => false,
                    b"1" => true,
                    _ => {
                        return Err(ParseError::new(format!(
                            "bad deleteoldrdn argument {:?}",
                            String::from_utf8_lossy(&value)
                        )))
                    }
                });
            }
            "newsuperior" => {
                if new_superior.is_some() {
                    return Err(ParseError::new("multiple newsuperior arguments"));
                }
                new_superior = Some(ldif::value_to_string(&attr, value)?);
            }
            _ => return Err(ParseError::new(format!("bad type {:?} in modrdn record", attr))),
        }
    }
    match (new_rdn, delete_old_rdn) {
        (Some(new_rdn), Some(delete_old_rdn)) => Ok(Change::Rename {
            new_rdn,
            delete_old_rdn,
            new_superior,
        }),
        _ => Err(ParseError::new(
            "modrdn requires \"newrdn\" and \"deleteoldrdn\"",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD_RECORD: &str = "replica: host1:389\n\
                              time: 1000.0\n\
                              dn: cn=x,dc=example\n\
                              changetype: add\n\
                              objectClass: person\n\
                              cn: x\n\
                              sn: y\n";

    mod replica_id {
        use super::*;

        #[test]
        fn test_parse_with_port() {
            let id = ReplicaId::parse("ldap1.example.com:1389").unwrap();
            assert_eq!(id, ReplicaId::new("ldap1.example.com", 1389));
        }

        #[test]
        fn test_parse_defaults_port() {
            assert_eq!(ReplicaId::parse("ldap1").unwrap().port, DEFAULT_PORT);
            assert_eq!(ReplicaId::parse("ldap1:").unwrap().port, DEFAULT_PORT);
        }

        #[test]
        fn test_parse_rejects_bad_port() {
            assert!(ReplicaId::parse("ldap1:abc").is_err());
            assert!(ReplicaId::parse(":389").is_err());
        }

        #[test]
        fn test_display() {
            assert_eq!(ReplicaId::new("h", 636).to_string(), "h:636");
        }
    }

    mod stamp {
        use super::*;

        #[test]
        fn test_parse_with_and_without_sequence() {
            assert_eq!(Stamp::parse("1000").unwrap(), Stamp::new(1000, 0));
            assert_eq!(Stamp::parse("1000.7").unwrap(), Stamp::new(1000, 7));
            assert_eq!(Stamp::parse("1000.").unwrap(), Stamp::new(1000, 0));
        }

        #[test]
        fn test_parse_rejects_garbage() {
            assert!(Stamp::parse("soon").is_err());
            assert!(Stamp::parse("1000.99999999999").is_err());
        }

        #[test]
        fn test_lexicographic_order() {
            assert!(Stamp::new(1000, 5) < Stamp::new(1001, 0));
            assert!(Stamp::new(1000, 1) < Stamp::new(1000, 2));
            assert_eq!(Stamp::new(5, 1).next_in_second(), Stamp::new(5, 2));
        }
    }

    mod parse {
        use super::*;

        #[test]
        fn test_parse_add() {
            let record = ChangeRecord::parse(ADD_RECORD).unwrap();
            assert_eq!(record.targets, vec![ReplicaId::new("host1", 389)]);
            assert_eq!(record.stamp, Stamp::new(1000, 0));
            assert_eq!(record.dn, "cn=x,dc=example");
            assert_eq!(record.kind(), ChangeKind::Add);
            match record.change {
                Change::Add { attributes } => {
                    assert_eq!(attributes.len(), 3);
                    assert_eq!(attributes[1], AttributeValue::new("cn", "x"));
                }
                other => panic!("unexpected change {:?}", other),
            }
        }

        #[test]
        fn test_parse_modify_blocks_in_order() {
            let text = "replica: host1\n\
                        time: 2000\n\
                        dn: cn=x,dc=example\n\
                        changetype: modify\n\
                        replace: mail\n\
                        mail: a@example.com\n\
                        mail: b@example.com\n\
                        -\n\
                        delete: description\n\
                        -\n\
                        increment: uidNumber\n\
                        uidNumber: 1\n\
                        -\n";
            let record = ChangeRecord::parse(text).unwrap();
            let Change::Modify { modifications } = record.change else {
                panic!("expected modify");
            };
            assert_eq!(modifications.len(), 3);
            assert_eq!(modifications[0].op, ModOp::Replace);
            assert_eq!(modifications[0].values.len(), 2);
            assert_eq!(modifications[1], Modification::new(ModOp::Delete, "description"));
            assert_eq!(modifications[2].op, ModOp::Increment);
        }

        #[test]
        fn test_parse_modify_last_separator_optional() {
            let text = "time: 1\ndn: cn=x\nchangetype: modify\nadd: cn\ncn: y\n";
            let record = ChangeRecord::parse(text).unwrap();
            let Change::Modify { modifications } = record.change else {
                panic!("expected modify");
            };
            assert_eq!(modifications, vec![Modification::new(ModOp::Add, "cn").with_value("y")]);
        }

        #[test]
        fn test_parse_modify_value_without_open_type_fails() {
            let text = "time: 1\ndn: cn=x\nchangetype: modify\ncn: y\n";
            assert!(ChangeRecord::parse(text).is_err());
        }

        #[test]
        fn test_parse_modify_mismatched_value_fails() {
            let text = "time: 1\ndn: cn=x\nchangetype: modify\nadd: cn\nsn: y\n-\n";
            assert!(ChangeRecord::parse(text).is_err());
        }

        #[test]
        fn test_parse_rename() {
            let text = "time: 1\ndn: cn=x,dc=a\nchangetype: modrdn\n\
                        newrdn: cn=y\ndeleteoldrdn: 1\nnewsuperior: dc=b\n";
            let record = ChangeRecord::parse(text).unwrap();
            assert_eq!(
                record.change,
                Change::Rename {
                    new_rdn: "cn=y".to_string(),
                    delete_old_rdn: true,
                    new_superior: Some("dc=b".to_string()),
                }
            );
        }

        #[test]
        fn test_parse_rename_aliases_and_errors() {
            let ok = "time: 1\ndn: cn=x\nchangetype: moddn\nnewrdn: cn=y\ndeleteoldrdn: 0\n";
            assert_eq!(ChangeRecord::parse(ok).unwrap().kind(), ChangeKind::Rename);

            let missing = "time: 1\ndn: cn=x\nchangetype: modrdn\nnewrdn: cn=y\n";
            assert!(ChangeRecord::parse(missing).is_err());

            let bad_flag = "time: 1\ndn: cn=x\nchangetype: modrdn\nnewrdn: cn=y\ndeleteoldrdn: 2\n";
            assert!(ChangeRecord::parse(bad_flag).is_err());
        }

        #[test]
        fn test_parse_delete() {
            let record = ChangeRecord::parse("time: 5\ndn: cn=x\nchangetype: delete\n").unwrap();
            assert_eq!(record.change, Change::Delete);
            assert!(record.targets.is_empty());
        }

        #[test]
        fn test_missing_required_fields() {
            assert!(ChangeRecord::parse("dn: cn=x\nchangetype: delete\n").is_err());
            assert!(ChangeRecord::parse("time: 1\nchangetype: delete\n").is_err());
            assert!(ChangeRecord::parse("time: 1\ndn: cn=x\n").is_err());
        }

        #[test]
        fn test_unknown_changetype_fails() {
            assert!(ChangeRecord::parse("time: 1\ndn: cn=x\nchangetype: merge\n").is_err());
        }

        #[test]
        fn test_duplicate_header_fails() {
            assert!(ChangeRecord::parse("time: 1\ntime: 2\ndn: cn=x\nchangetype: delete\n").is_err());
        }

        #[test]
        fn test_error_line_is_skipped() {
            let text = format!("ERROR: Already exists: entry exists\n{}", ADD_RECORD);
            let record = ChangeRecord::parse(&text).unwrap();
            assert_eq!(record.dn, "cn=x,dc=example");
        }

        #[test]
        fn test_multibyte_header_does_not_panic() {
            // 'é' straddles the byte where a "replica" prefix would end
            let record = ChangeRecord::parse("dn: cné=x\ntime: 1\nchangetype: delete\n").unwrap();
            assert_eq!(record.dn, "cné=x");
            assert!(record.targets.is_empty());
            assert!(ChangeRecord::parse("abcdefé: x\ntime: 1\n").is_err());
            assert!(!has_type("replicé: h", "replica"));
            assert!(has_type("Replica: h", "replica"));
        }

        #[test]
        fn test_duplicate_replica_lines_are_unioned() {
            let text = format!("replica: host1:389\nreplica: host2\n{}", ADD_RECORD);
            let record = ChangeRecord::parse(&text).unwrap();
            assert_eq!(
                record.targets,
                vec![ReplicaId::new("host1", 389), ReplicaId::new("host2", 389)]
            );
        }
    }

    mod serialize {
        use super::*;

        #[test]
        fn test_write_matches_log_layout() {
            let record = ChangeRecord::parse(ADD_RECORD).unwrap();
            assert_eq!(
                record.to_ldif(),
                "replica: host1:389\ntime: 1000.0\ndn: cn=x,dc=example\nchangetype: add\n\
                 objectClass: person\ncn: x\nsn: y\n\n"
            );
        }

        #[test]
        fn test_write_for_single_replica() {
            let text = format!("replica: host2:389\n{}", ADD_RECORD);
            let record = ChangeRecord::parse(&text).unwrap();
            let out = record.to_ldif_for(&ReplicaId::new("host1", 389));
            assert!(out.starts_with("replica: host1:389\ntime: 1000.0\n"));
            assert_eq!(out.matches("replica:").count(), 1);
        }

        #[test]
        fn test_roundtrip_with_newlines_and_non_ascii() {
            let record = ChangeRecord::new(
                vec![ReplicaId::new("h1", 389), ReplicaId::new("h2", 1389)],
                Stamp::new(1_700_000_000, 3),
                "cn=Jos\u{e9},dc=example",
                Change::Modify {
                    modifications: vec![
                        Modification::new(ModOp::Replace, "description")
                            .with_value("line one\nline two")
                            .with_value(vec![0u8, 159, 146, 150]),
                        Modification::new(ModOp::Delete, "seeAlso"),
                    ],
                },
            );
            let parsed = ChangeRecord::parse(&record.to_ldif()).unwrap();
            assert_eq!(parsed, record);
        }

        #[test]
        fn test_roundtrip_rename() {
            let record = ChangeRecord::new(
                vec![ReplicaId::new("h1", 389)],
                Stamp::new(10, 0),
                "cn=a,dc=example",
                Change::Rename {
                    new_rdn: "cn=b".to_string(),
                    delete_old_rdn: false,
                    new_superior: None,
                },
            );
            assert_eq!(ChangeRecord::parse(&record.to_ldif()).unwrap(), record);
        }
    }
}
