//! Merge planning: clustering linked pairs and resolving fields.
//!
//! Clusters are the connected components of the auto-merge links (a
//! disjoint-set forest, built single-threaded after all pairs are scored).
//! For every cluster the planner picks a survivor and decides, field by
//! field, which member supplies the value. The resulting [`MergePlan`] is
//! plain data; [`build_survivor`] turns a plan plus the members' pre-merge
//! state into the merged record, so a plan stored in the audit log can be
//! re-applied or reverted later.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::{Field, FieldValue, Property, Record, RecordId, RecordStatus};
use crate::normalize::{email_key, phone_key};
use crate::scoring::{MatchCandidate, MatchDecision, MatchThresholds};
use crate::vcard::escape_text;

/// Property carrying a value that lost a merge conflict.
pub const MERGE_ALTERNATIVE: &str = "X-MERGE-ALT";

// ============ Disjoint sets ============

/// Union-find over record ids with path compression and union by rank.
#[derive(Debug, Default)]
pub struct DisjointSets {
    index: HashMap<RecordId, usize>,
    ids: Vec<RecordId>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, id: &str) -> usize {
        if let Some(&i) = self.index.get(id) {
            return i;
        }
        let i = self.ids.len();
        self.index.insert(id.to_string(), i);
        self.ids.push(id.to_string());
        self.parent.push(i);
        self.rank.push(0);
        i
    }

    fn find(&mut self, mut i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[i] != root {
            let next = self.parent[i];
            self.parent[i] = root;
            i = next;
        }
        root
    }

    pub fn union(&mut self, a: &str, b: &str) {
        let (ia, ib) = (self.add(a), self.add(b));
        let (ra, rb) = (self.find(ia), self.find(ib));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    pub fn connected(&mut self, a: &str, b: &str) -> bool {
        match (self.index.get(a).copied(), self.index.get(b).copied()) {
            (Some(ia), Some(ib)) => self.find(ia) == self.find(ib),
            _ => a == b,
        }
    }

    /// Sets with two or more members; members and sets sorted by id.
    pub fn groups(&mut self) -> Vec<Vec<RecordId>> {
        let mut by_root: BTreeMap<usize, Vec<RecordId>> = BTreeMap::new();
        for i in 0..self.ids.len() {
            let root = self.find(i);
            by_root.entry(root).or_default().push(self.ids[i].clone());
        }
        let mut groups: Vec<Vec<RecordId>> = by_root
            .into_values()
            .filter(|g| g.len() > 1)
            .map(|mut g| {
                g.sort();
                g
            })
            .collect();
        groups.sort();
        groups
    }
}

/// Groups transitively linked auto-merge pairs into clusters.
pub fn cluster_pairs(candidates: &[MatchCandidate], thresholds: &MatchThresholds) -> Vec<Vec<RecordId>> {
    let mut sets = DisjointSets::new();
    for candidate in candidates {
        if thresholds.decide(candidate) == MatchDecision::AutoMerge {
            sets.union(&candidate.record_a, &candidate.record_b);
        }
    }
    sets.groups()
}

// ============ Plans ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionReason {
    /// Multi-valued field: every member's values, normalized and de-duplicated.
    Union,
    /// Value from the highest-priority source.
    SourcePriority,
    /// Candidates were equally ranked; the survivor's value was kept.
    Survivor,
    /// Candidates were equally ranked; the earliest import's value was kept.
    EarliestImport,
    /// Photo with the largest pixel area (then byte size).
    LargestPhoto,
    /// No member has a value.
    NoValue,
}

/// How one field of the merged record was decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldResolution {
    pub field: Field,
    /// Member that supplied the winning value.
    pub source_record: RecordId,
    pub reason: ResolutionReason,
    /// Distinct values tied at the top priority.
    pub conflicted: bool,
    /// Losing values of a conflict, kept on the merged record.
    pub preserved: Vec<String>,
}

/// A merge of one cluster into its survivor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub plan_id: String,
    pub surviving_record_id: RecordId,
    pub absorbed_record_ids: Vec<RecordId>,
    pub field_resolutions: Vec<FieldResolution>,
    /// Version of every member when the plan was made.
    pub member_versions: BTreeMap<RecordId, u64>,
}

impl MergePlan {
    pub fn member_ids(&self) -> Vec<RecordId> {
        let mut ids = vec![self.surviving_record_id.clone()];
        ids.extend(self.absorbed_record_ids.iter().cloned());
        ids
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &FieldResolution> {
        self.field_resolutions.iter().filter(|r| r.conflicted)
    }
}

/// Most populated record, then earliest import, then smallest id.
pub fn select_survivor(members: &[Record]) -> Option<&Record> {
    members.iter().min_by(|a, b| {
        b.non_null_field_count()
            .cmp(&a.non_null_field_count())
            .then_with(|| a.provenance.imported_at.cmp(&b.provenance.imported_at))
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Comparison form of a value: case and surrounding whitespace do not make values distinct.
fn comparable(value: &FieldValue) -> String {
    match value {
        FieldValue::Name(Some(n)) => n
            .parts()
            .iter()
            .map(|p| p.trim().to_lowercase())
            .collect::<Vec<_>>()
            .join(";"),
        other => other.summary().trim().to_lowercase(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergePlanner {
    source_priority: Vec<String>,
}

impl MergePlanner {
    /// `source_priority` lists source labels, highest priority first.
    pub fn new(source_priority: Vec<String>) -> Self {
        Self { source_priority }
    }

    fn source_rank(&self, record: &Record) -> usize {
        self.source_priority
            .iter()
            .position(|s| s == &record.provenance.source)
            .unwrap_or(self.source_priority.len())
    }

    /// Plans the merge of a cluster. Returns `None` for fewer than two active members.
    pub fn plan(&self, members: &[Record]) -> Option<MergePlan> {
        let mut members: Vec<&Record> = members.iter().filter(|r| r.is_active()).collect();
        if members.len() < 2 {
            return None;
        }
        members.sort_by(|a, b| {
            a.provenance
                .imported_at
                .cmp(&b.provenance.imported_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let owned: Vec<Record> = members.iter().map(|r| (*r).clone()).collect();
        let survivor = select_survivor(&owned)?;

        let mut resolutions = Vec::new();
        for field in [
            Field::FormattedName,
            Field::StructuredName,
            Field::Organization,
            Field::JobTitle,
        ] {
            resolutions.push(self.resolve_single(field, &members, survivor));
        }
        for field in [Field::Emails, Field::Phones, Field::Notes] {
            resolutions.push(FieldResolution {
                field,
                source_record: survivor.id.clone(),
                reason: ResolutionReason::Union,
                conflicted: false,
                preserved: Vec::new(),
            });
        }
        resolutions.push(resolve_photo(&members, survivor));

        let plan = MergePlan {
            plan_id: Uuid::new_v4().to_string(),
            surviving_record_id: survivor.id.clone(),
            absorbed_record_ids: members
                .iter()
                .filter(|r| r.id != survivor.id)
                .map(|r| r.id.clone())
                .collect(),
            field_resolutions: resolutions,
            member_versions: members.iter().map(|r| (r.id.clone(), r.version)).collect(),
        };
        debug!(
            "Planned merge {} of {} record(s) into {} ({} conflict(s))",
            plan.plan_id,
            members.len(),
            plan.surviving_record_id,
            plan.conflicts().count()
        );
        Some(plan)
    }

    fn resolve_single(&self, field: Field, members: &[&Record], survivor: &Record) -> FieldResolution {
        let candidates: Vec<&Record> = members
            .iter()
            .copied()
            .filter(|r| !r.get(field).is_null())
            .collect();
        let Some(best_rank) = candidates.iter().map(|r| self.source_rank(r)).min() else {
            return FieldResolution {
                field,
                source_record: survivor.id.clone(),
                reason: ResolutionReason::NoValue,
                conflicted: false,
                preserved: Vec::new(),
            };
        };
        let top: Vec<&Record> = candidates
            .iter()
            .copied()
            .filter(|r| self.source_rank(r) == best_rank)
            .collect();

        // members are sorted by import time, so top[0] is the earliest
        let winner = top
            .iter()
            .copied()
            .find(|r| r.id == survivor.id)
            .unwrap_or(top[0]);
        let outranked_others = candidates.iter().any(|r| self.source_rank(r) > best_rank);
        let reason = if outranked_others {
            ResolutionReason::SourcePriority
        } else if winner.id == survivor.id {
            ResolutionReason::Survivor
        } else {
            ResolutionReason::EarliestImport
        };

        let winning = comparable(&winner.get(field));
        let mut seen: HashSet<String> = HashSet::from([winning]);
        let preserved: Vec<String> = top
            .iter()
            .map(|r| r.get(field))
            .filter(|v| seen.insert(comparable(v)))
            .map(|v| v.summary())
            .collect();

        FieldResolution {
            field,
            source_record: winner.id.clone(),
            reason,
            conflicted: !preserved.is_empty(),
            preserved,
        }
    }
}

fn resolve_photo(members: &[&Record], survivor: &Record) -> FieldResolution {
    // largest area, then largest file; ties go to the survivor, then the earliest import
    let best = members
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.photo.as_ref().map(|p| (i, r, p)))
        .max_by(|(ia, ra, pa), (ib, rb, pb)| {
            pa.pixel_area()
                .cmp(&pb.pixel_area())
                .then_with(|| pa.byte_size.cmp(&pb.byte_size))
                .then_with(|| (ra.id == survivor.id).cmp(&(rb.id == survivor.id)))
                .then_with(|| ib.cmp(ia))
        })
        .map(|(_, record, _)| record);
    match best {
        Some(record) => FieldResolution {
            field: Field::Photo,
            source_record: record.id.clone(),
            reason: ResolutionReason::LargestPhoto,
            conflicted: false,
            preserved: Vec::new(),
        },
        None => FieldResolution {
            field: Field::Photo,
            source_record: survivor.id.clone(),
            reason: ResolutionReason::NoValue,
            conflicted: false,
            preserved: Vec::new(),
        },
    }
}

// ============ Applying a plan ============

/// Builds the merged survivor (version + 1) from a plan and the members'
/// pre-merge state. Absorbed records are not touched.
pub fn build_survivor(plan: &MergePlan, members: &[Record]) -> Result<Record, PipelineError> {
    let by_id: HashMap<&str, &Record> = members.iter().map(|r| (r.id.as_str(), r)).collect();
    let lookup = |id: &str| {
        by_id.get(id).copied().ok_or_else(|| {
            PipelineError::Parse(format!("merge plan {} references unknown record {}", plan.plan_id, id))
        })
    };

    let survivor = lookup(&plan.surviving_record_id)?;
    let ordered: Vec<&Record> = std::iter::once(Ok(survivor))
        .chain(plan.absorbed_record_ids.iter().map(|id| lookup(id)))
        .collect::<Result<_, _>>()?;

    let mut merged = survivor.clone();
    for resolution in &plan.field_resolutions {
        match resolution.reason {
            ResolutionReason::Union => match resolution.field {
                Field::Emails => {
                    merged.emails = union_values(&ordered, |r| &r.emails, |e| email_key(e));
                }
                Field::Phones => {
                    merged.phones = union_values(&ordered, |r| &r.phones, |p| {
                        let key = phone_key(p);
                        if key.is_empty() {
                            p.trim().to_string()
                        } else {
                            key
                        }
                    });
                }
                Field::Notes => {
                    let mut seen = HashSet::new();
                    let notes: Vec<&str> = ordered
                        .iter()
                        .filter_map(|r| r.notes.as_deref())
                        .map(str::trim)
                        .filter(|n| !n.is_empty() && seen.insert(n.to_string()))
                        .collect();
                    merged.notes = (!notes.is_empty()).then(|| notes.join("\n"));
                }
                other => {
                    return Err(PipelineError::Parse(format!(
                        "field {} cannot be merged by union",
                        other
                    )))
                }
            },
            ResolutionReason::NoValue => {}
            _ => {
                let source = lookup(&resolution.source_record)?;
                merged.set(resolution.field, source.get(resolution.field));
            }
        }
        for value in &resolution.preserved {
            let mut alt = Property::new(MERGE_ALTERNATIVE, escape_text(value));
            alt.params.push(format!("FIELD={}", resolution.field));
            if !merged.extra.contains(&alt) {
                merged.extra.push(alt);
            }
        }
    }

    for member in ordered.iter().skip(1) {
        for prop in &member.extra {
            if !merged.extra.contains(prop) {
                merged.extra.push(prop.clone());
            }
        }
        for value in &member.value_params {
            merged.add_params(&value.property, &value.key, &value.params);
        }
    }

    merged.status = RecordStatus::Active;
    merged.merged_into = None;
    merged.touch();
    Ok(merged)
}

fn union_values<'a, G, K>(members: &[&'a Record], get: G, key: K) -> Vec<String>
where
    G: Fn(&'a Record) -> &'a Vec<String>,
    K: Fn(&str) -> String,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for member in members {
        for value in get(member) {
            if seen.insert(key(value)) {
                out.push(value.clone());
            }
        }
    }
    out
}

/// The absorbed member flipped to `merged` (version + 1). Its data is left as it was.
pub fn absorb(record: &Record, survivor_id: &str) -> Record {
    let mut absorbed = record.clone();
    absorbed.status = RecordStatus::Merged;
    absorbed.merged_into = Some(survivor_id.to_string());
    absorbed.touch();
    absorbed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Organization, Photo, Provenance};
    use chrono::{Duration, Utc};

    fn member(id: &str, source: &str, minutes: i64) -> Record {
        let mut r = Record::new(
            id,
            Provenance {
                source: source.to_string(),
                imported_at: Utc::now() - Duration::minutes(100 - minutes),
            },
        );
        r.version = 3;
        r.format_version = Some("3.0".to_string());
        r.names.formatted = Some(format!("Person {}", id));
        r
    }

    #[test]
    fn test_union_find_transitive() {
        let mut sets = DisjointSets::new();
        sets.union("a", "b");
        sets.union("b", "c");
        sets.union("x", "y");
        assert!(sets.connected("a", "c"));
        assert!(!sets.connected("a", "x"));
        assert_eq!(
            sets.groups(),
            vec![vec!["a", "b", "c"], vec!["x", "y"]]
                .into_iter()
                .map(|g| g.into_iter().map(String::from).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_survivor_selection() {
        let mut rich = member("b", "crm", 10);
        rich.emails.push("b@x.com".to_string());
        let early = member("a", "crm", 0);
        let late_twin = member("c", "crm", 50);
        let members = vec![early.clone(), rich.clone(), late_twin];
        assert_eq!(select_survivor(&members).unwrap().id, "b");
        let members = vec![member("z", "crm", 50), early];
        assert_eq!(select_survivor(&members).unwrap().id, "a");
    }

    #[test]
    fn test_source_priority_and_conflicts() {
        let mut a = member("a", "phone", 0);
        a.organization = Some(Organization::named("Acme"));
        a.job_title = Some("Engineer".to_string());
        a.emails.push("a@x.com".to_string());
        let mut b = member("b", "crm", 1);
        b.organization = Some(Organization::named("Acme Corp"));
        b.job_title = Some("engineer".to_string());
        let mut c = member("c", "phone", 2);
        c.organization = Some(Organization::named("Globex"));

        let planner = MergePlanner::new(vec!["crm".to_string()]);
        let plan = planner.plan(&[a.clone(), b.clone(), c.clone()]).unwrap();
        assert_eq!(plan.surviving_record_id, "a");
        let org = plan
            .field_resolutions
            .iter()
            .find(|r| r.field == Field::Organization)
            .unwrap();
        assert_eq!(org.source_record, "b");
        assert_eq!(org.reason, ResolutionReason::SourcePriority);
        assert!(!org.conflicted);

        // Without priorities the org is a three-way conflict the survivor wins
        let plan = MergePlanner::default().plan(&[a.clone(), b, c]).unwrap();
        let org = plan
            .field_resolutions
            .iter()
            .find(|r| r.field == Field::Organization)
            .unwrap();
        assert_eq!(org.source_record, "a");
        assert!(org.conflicted);
        assert_eq!(org.preserved, vec!["Acme Corp", "Globex"]);
        // case-only differences are not conflicts
        let title = plan
            .field_resolutions
            .iter()
            .find(|r| r.field == Field::JobTitle)
            .unwrap();
        assert!(!title.conflicted);
    }

    #[test]
    fn test_build_survivor_unions_and_preserves() {
        let mut a = member("a", "phone", 0);
        a.emails = vec!["a@x.com".to_string()];
        a.phones = vec!["+15550001111".to_string()];
        a.organization = Some(Organization::named("Acme"));
        a.notes = Some("met at conf".to_string());
        let mut b = member("b", "crm", 1);
        b.emails = vec!["A@x.com".to_string(), "b@y.com".to_string()];
        b.phones = vec!["+15550002222".to_string(), "+1 555 000 1111".to_string()];
        b.organization = Some(Organization::named("Globex"));
        b.notes = Some("met at conf".to_string());
        b.photo = Some(Photo::from_bytes(None, crate::photo::fixtures::png(64, 64)));
        b.extra.push(Property::new("URL", "https://b.example"));

        let members = vec![a.clone(), b.clone()];
        let plan = MergePlanner::default().plan(&members).unwrap();
        let merged = build_survivor(&plan, &members).unwrap();
        assert_eq!(merged.id, plan.surviving_record_id);
        assert_eq!(merged.version, 4);
        assert_eq!(merged.emails.len(), 2);
        assert_eq!(merged.phones.len(), 2);
        assert_eq!(merged.notes.as_deref(), Some("met at conf"));
        assert!(merged.photo.is_some());
        assert!(merged.extra.iter().any(|p| p.name == "URL"));
        let alt = merged
            .extra
            .iter()
            .find(|p| p.name == MERGE_ALTERNATIVE)
            .unwrap();
        assert_eq!(alt.param("FIELD"), Some("ORG"));
    }

    #[test]
    fn test_build_survivor_keeps_value_params() {
        let mut a = member("a", "phone", 0);
        a.phones = vec!["+15550001111".to_string()];
        a.add_params("TEL", "+15550001111", &["TYPE=CELL".to_string()]);
        let mut b = member("b", "crm", 1);
        b.phones = vec!["+1 555 000 1111".to_string()];
        b.emails = vec!["b@y.com".to_string()];
        b.add_params("TEL", "+1 555 000 1111", &["TYPE=WORK".to_string()]);
        b.add_params("EMAIL", "b@y.com", &["TYPE=INTERNET".to_string()]);

        let members = vec![a, b];
        let plan = MergePlanner::default().plan(&members).unwrap();
        let merged = build_survivor(&plan, &members).unwrap();
        assert_eq!(merged.phones.len(), 1);
        let tel = merged.params_for("TEL", &merged.phones[0]);
        assert!(tel.contains(&"TYPE=CELL".to_string()));
        assert!(tel.contains(&"TYPE=WORK".to_string()));
        assert_eq!(merged.params_for("EMAIL", "B@y.com"), ["TYPE=INTERNET".to_string()]);
    }

    #[test]
    fn test_photo_prefers_pixel_area_then_size() {
        let mut a = member("a", "s", 0);
        a.photo = Some(Photo::from_bytes(None, crate::photo::fixtures::png(10, 10)));
        let mut b = member("b", "s", 1);
        b.photo = Some(Photo::from_bytes(None, crate::photo::fixtures::png(20, 20)));
        let members = [&a, &b];
        assert_eq!(resolve_photo(&members, &a).source_record, "b");

        let mut bigger_file = crate::photo::fixtures::png(10, 10);
        bigger_file.extend_from_slice(&[0; 16]);
        b.photo = Some(Photo::from_bytes(None, bigger_file));
        let members = [&a, &b];
        assert_eq!(resolve_photo(&members, &a).source_record, "b");

        b.photo = a.photo.clone();
        let members = [&a, &b];
        assert_eq!(resolve_photo(&members, &a).source_record, "a");
        assert_eq!(resolve_photo(&members, &b).source_record, "b");
    }

    #[test]
    fn test_absorb_marks_merged() {
        let a = member("a", "s", 0);
        let absorbed = absorb(&a, "z");
        assert_eq!(absorbed.status, RecordStatus::Merged);
        assert_eq!(absorbed.merged_into.as_deref(), Some("z"));
        assert_eq!(absorbed.version, a.version + 1);
        assert_eq!(absorbed.emails, a.emails);
    }
}
