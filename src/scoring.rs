//! Pairwise similarity scoring.
//!
//! Every composite score comes with the evidence that produced it: which
//! values were shared, how similar names and organizations were, whether the
//! agreement boost fired and which penalties applied.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::blocking::CandidatePair;
use crate::models::{Record, RecordId, ALL_FIELDS};
use crate::normalize::{email_key, name_key, organization_key, phone_key, phones_match};

const IDENTITY_WEIGHT: f64 = 0.55;
const NAME_WEIGHT: f64 = 0.25;
const ORGANIZATION_WEIGHT: f64 = 0.10;
const CONTACT_WEIGHT: f64 = 0.10;

/// A component "agrees" above this level.
const AGREEMENT_LEVEL: f64 = 0.5;
/// Components that must agree for the boost.
const AGREEING_COMPONENTS: usize = 3;
/// Strength of the agreement boost, applied as `1 - (1 - c)(1 - BOOST)`.
const BOOST: f64 = 0.25;
/// Down-weight per distinct-signal (emails, phones, organizations).
const PENALTY_PER_SIGNAL: f64 = 0.25;
/// Organizations below this similarity count as different.
const DISTINCT_ORGANIZATION_LEVEL: f64 = 0.5;

/// Component scores, each in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    /// 1.0 on a shared email or phone, name similarity otherwise.
    pub identity: f64,
    pub name: f64,
    /// Absent when either record has no organization.
    pub organization: Option<f64>,
    /// Jaccard overlap of normalized emails and phones.
    pub contact: f64,
    /// Fraction removed from the score by contextual penalties.
    pub penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Evidence {
    SharedEmail { email: String },
    SharedPhone { phone: String },
    NameSimilarity { a: String, b: String, score: f64 },
    OrganizationSimilarity { a: String, b: String, score: f64 },
    ContactOverlap { shared: usize, total: usize },
    AgreementBoost { agreeing: usize, before: f64, after: f64 },
    DistinctEmails,
    DistinctPhones,
    DistinctOrganizations { a: String, b: String },
    Penalty { factor: f64, before: f64, after: f64 },
}

/// A scored candidate pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub record_a: RecordId,
    pub record_b: RecordId,
    pub block_key: String,
    pub composite_score: f64,
    /// Score before contextual penalties.
    pub unpenalized_score: f64,
    pub component_scores: ComponentScores,
    pub evidence: Vec<Evidence>,
    /// Fields populated on both records; breaks ties between equal scores.
    pub overlap_fields: usize,
}

impl MatchCandidate {
    pub fn is_penalized(&self) -> bool {
        self.component_scores.penalty > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchDecision {
    /// Linked for automatic merging.
    AutoMerge,
    /// Uncertain, or down-weighted by context: a human decides.
    Review,
    NoMatch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThresholds {
    pub auto_merge: f64,
    pub review: f64,
}

impl MatchThresholds {
    pub fn decide(&self, candidate: &MatchCandidate) -> MatchDecision {
        if candidate.composite_score >= self.auto_merge {
            MatchDecision::AutoMerge
        } else if candidate.composite_score >= self.review {
            MatchDecision::Review
        } else if candidate.is_penalized() && candidate.unpenalized_score >= self.review {
            MatchDecision::Review
        } else {
            MatchDecision::NoMatch
        }
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> (f64, usize, usize) {
    let shared = a.intersection(b).count();
    let total = a.union(b).count();
    if total == 0 {
        (0.0, 0, 0)
    } else {
        (shared as f64 / total as f64, shared, total)
    }
}

fn contact_keys(record: &Record) -> BTreeSet<String> {
    record
        .emails
        .iter()
        .map(|e| format!("e:{}", email_key(e)))
        .chain(
            record
                .phones
                .iter()
                .map(|p| phone_key(p))
                .filter(|k| !k.is_empty())
                .map(|k| format!("p:{}", k)),
        )
        .collect()
}

fn comparable_name(record: &Record) -> String {
    record
        .display_name()
        .map(name_key)
        .or_else(|| {
            record
                .names
                .structured
                .as_ref()
                .map(|n| name_key(&n.display()))
        })
        .unwrap_or_default()
}

/// Scores one pair.
pub fn score_pair(a: &Record, b: &Record, block_key: &str) -> MatchCandidate {
    let mut evidence = Vec::new();

    // Identity: exact shared contact value
    let emails_b: BTreeSet<String> = b.emails.iter().map(|e| email_key(e)).collect();
    let shared_emails: Vec<String> = a
        .emails
        .iter()
        .map(|e| email_key(e))
        .filter(|k| emails_b.contains(k))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let shared_phones: Vec<String> = a
        .phones
        .iter()
        .filter(|pa| {
            b.phones
                .iter()
                .any(|pb| phones_match(&phone_key(pa), &phone_key(pb)))
        })
        .cloned()
        .collect();
    for email in &shared_emails {
        evidence.push(Evidence::SharedEmail {
            email: email.clone(),
        });
    }
    for phone in &shared_phones {
        evidence.push(Evidence::SharedPhone {
            phone: phone.clone(),
        });
    }

    let (name_a, name_b) = (comparable_name(a), comparable_name(b));
    let name = if name_a.is_empty() || name_b.is_empty() {
        0.0
    } else {
        strsim::jaro_winkler(&name_a, &name_b)
    };
    evidence.push(Evidence::NameSimilarity {
        a: name_a,
        b: name_b,
        score: name,
    });
    let identity = if shared_emails.is_empty() && shared_phones.is_empty() {
        name
    } else {
        1.0
    };

    let organization = match (&a.organization, &b.organization) {
        (Some(oa), Some(ob)) if !oa.name.trim().is_empty() && !ob.name.trim().is_empty() => {
            let (ka, kb) = (organization_key(&oa.name), organization_key(&ob.name));
            let score = strsim::normalized_levenshtein(&ka, &kb);
            evidence.push(Evidence::OrganizationSimilarity {
                a: oa.name.clone(),
                b: ob.name.clone(),
                score,
            });
            Some(score)
        }
        _ => None,
    };

    let (contact, shared, total) = jaccard(&contact_keys(a), &contact_keys(b));
    if total > 0 {
        evidence.push(Evidence::ContactOverlap { shared, total });
    }

    // Weighted sum, renormalized when the organization is unknown
    let (mut weighted, mut weights) = (
        IDENTITY_WEIGHT * identity + NAME_WEIGHT * name + CONTACT_WEIGHT * contact,
        IDENTITY_WEIGHT + NAME_WEIGHT + CONTACT_WEIGHT,
    );
    if let Some(org) = organization {
        weighted += ORGANIZATION_WEIGHT * org;
        weights += ORGANIZATION_WEIGHT;
    }
    let mut score = weighted / weights;

    let identity_match = !shared_emails.is_empty() || !shared_phones.is_empty();
    // identity only counts on its own when backed by a shared email or phone;
    // otherwise it is the name score again
    let independent_identity = identity_match.then_some(identity);
    let agreeing = [independent_identity, Some(name), organization, Some(contact)]
        .into_iter()
        .flatten()
        .filter(|c| *c > AGREEMENT_LEVEL)
        .count();
    if agreeing >= AGREEING_COMPONENTS {
        let boosted = 1.0 - (1.0 - score) * (1.0 - BOOST);
        evidence.push(Evidence::AgreementBoost {
            agreeing,
            before: score,
            after: boosted,
        });
        score = boosted;
    }
    let unpenalized_score = score.clamp(0.0, 1.0);

    // Contextual penalty: similar names, otherwise different people.
    // An exact shared email or phone outweighs contradicting fields.
    let mut penalty: f64 = 0.0;
    if !identity_match && !a.emails.is_empty() && !b.emails.is_empty() {
        penalty += PENALTY_PER_SIGNAL;
        evidence.push(Evidence::DistinctEmails);
    }
    if !identity_match && !a.phones.is_empty() && !b.phones.is_empty() {
        penalty += PENALTY_PER_SIGNAL;
        evidence.push(Evidence::DistinctPhones);
    }
    if let (false, Some(org), Some(oa), Some(ob)) =
        (identity_match, organization, &a.organization, &b.organization)
    {
        if org < DISTINCT_ORGANIZATION_LEVEL {
            penalty += PENALTY_PER_SIGNAL;
            evidence.push(Evidence::DistinctOrganizations {
                a: oa.name.clone(),
                b: ob.name.clone(),
            });
        }
    }
    let penalty = penalty.min(1.0);
    let composite_score = (unpenalized_score * (1.0 - penalty)).clamp(0.0, 1.0);
    if penalty > 0.0 {
        evidence.push(Evidence::Penalty {
            factor: penalty,
            before: unpenalized_score,
            after: composite_score,
        });
    }

    let overlap_fields = ALL_FIELDS
        .iter()
        .filter(|f| !a.get(**f).is_null() && !b.get(**f).is_null())
        .count();

    let (record_a, record_b) = if a.id <= b.id {
        (a.id.clone(), b.id.clone())
    } else {
        (b.id.clone(), a.id.clone())
    };
    MatchCandidate {
        record_a,
        record_b,
        block_key: block_key.to_string(),
        composite_score,
        unpenalized_score,
        component_scores: ComponentScores {
            identity,
            name,
            organization,
            contact,
            penalty,
        },
        evidence,
        overlap_fields,
    }
}

/// Scores every candidate pair in parallel. Pairs naming unknown ids are skipped.
pub fn score_candidates(records: &[Record], pairs: &[CandidatePair]) -> Vec<MatchCandidate> {
    let by_id: HashMap<&str, &Record> = records.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut scored: Vec<MatchCandidate> = pairs
        .par_iter()
        .filter_map(|pair| {
            let a = by_id.get(pair.a.as_str())?;
            let b = by_id.get(pair.b.as_str())?;
            Some(score_pair(a, b, &pair.block_key))
        })
        .collect();
    rank(&mut scored);
    debug!("Scored {} candidate pair(s)", scored.len());
    scored
}

/// Highest score first; equal scores prefer more overlapping fields, then ids.
pub fn rank(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|x, y| {
        y.composite_score
            .partial_cmp(&x.composite_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| y.overlap_fields.cmp(&x.overlap_fields))
            .then_with(|| (&x.record_a, &x.record_b).cmp(&(&y.record_a, &y.record_b)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Organization, Provenance};
    use chrono::Utc;

    fn record(id: &str, name: &str) -> Record {
        let mut r = Record::new(
            id,
            Provenance {
                source: "test".to_string(),
                imported_at: Utc::now(),
            },
        );
        r.names.formatted = Some(name.to_string());
        r
    }

    #[test]
    fn test_shared_email_with_suffix_stripped_org() {
        let mut a = record("a", "Chris Xu");
        a.emails.push("c@x.com".to_string());
        a.organization = Some(Organization::named("Acme"));
        let mut b = record("b", "Chris Xu");
        b.emails.push("C@x.com".to_string());
        b.organization = Some(Organization::named("Acme Inc."));

        let c = score_pair(&a, &b, "email:c");
        assert_eq!(c.component_scores.identity, 1.0);
        assert_eq!(c.component_scores.organization, Some(1.0));
        assert!(c.composite_score >= 0.9, "score {}", c.composite_score);
        assert!(c.evidence.contains(&Evidence::SharedEmail {
            email: "c@x.com".to_string()
        }));
    }

    #[test]
    fn test_same_family_different_people() {
        let mut a = record("a", "John Smith");
        a.emails.push("john@acme.com".to_string());
        a.phones.push("+15550001111".to_string());
        a.organization = Some(Organization::named("Acme"));
        let mut b = record("b", "Jane Smith");
        b.emails.push("jane@globex.com".to_string());
        b.phones.push("+15559998888".to_string());
        b.organization = Some(Organization::named("Globex Corporation"));

        let c = score_pair(&a, &b, "soundex:S530");
        assert!(c.composite_score < 0.3, "score {}", c.composite_score);
        assert_eq!(c.component_scores.penalty, 0.75);
        assert!(c.evidence.contains(&Evidence::DistinctEmails));
        assert!(c.evidence.contains(&Evidence::DistinctPhones));
        assert!(c
            .evidence
            .iter()
            .any(|e| matches!(e, Evidence::DistinctOrganizations { .. })));
    }

    #[test]
    fn test_shared_email_outweighs_distinct_phones() {
        let mut a = record("a", "Chris Xu");
        a.emails.push("c@x.com".to_string());
        a.phones.push("+15550001111".to_string());
        let mut b = record("b", "Chris Xu");
        b.emails.push("c@x.com".to_string());
        b.phones.push("+15550002222".to_string());

        let c = score_pair(&a, &b, "email:c");
        assert!(!c.is_penalized());
        assert!(!c.evidence.contains(&Evidence::DistinctPhones));
        assert!(c.composite_score >= 0.9, "score {}", c.composite_score);
    }

    #[test]
    fn test_name_and_org_alone_get_no_agreement_boost() {
        let mut a = record("a", "John Smith");
        a.organization = Some(Organization::named("Acme"));
        let mut b = record("b", "John Smith");
        b.organization = Some(Organization::named("Acme"));

        let c = score_pair(&a, &b, "soundex:S530");
        assert_eq!(c.component_scores.identity, c.component_scores.name);
        assert!(!c
            .evidence
            .iter()
            .any(|e| matches!(e, Evidence::AgreementBoost { .. })));
        assert!(c.composite_score < 0.9 + 1e-9, "score {}", c.composite_score);

        // the same pair sharing a phone has independent identity evidence
        a.phones.push("+15550001111".to_string());
        b.phones.push("+1 555 000 1111".to_string());
        let c = score_pair(&a, &b, "phone:0001111");
        assert!(c
            .evidence
            .iter()
            .any(|e| matches!(e, Evidence::AgreementBoost { agreeing: 4, .. })));
    }

    #[test]
    fn test_decisions() {
        let thresholds = MatchThresholds {
            auto_merge: 0.9,
            review: 0.6,
        };
        let mut c = score_pair(&record("a", "x"), &record("b", "y"), "k");
        c.composite_score = 0.95;
        assert_eq!(thresholds.decide(&c), MatchDecision::AutoMerge);
        c.composite_score = 0.7;
        assert_eq!(thresholds.decide(&c), MatchDecision::Review);
        c.composite_score = 0.2;
        c.unpenalized_score = 0.8;
        assert_eq!(thresholds.decide(&c), MatchDecision::NoMatch);
        c.component_scores.penalty = 0.75;
        assert_eq!(thresholds.decide(&c), MatchDecision::Review);
    }

    #[test]
    fn test_symmetric_and_ordered_ids() {
        let mut a = record("z", "Ann Lee");
        a.phones.push("+15551234567".to_string());
        let mut b = record("m", "Anne Lee");
        b.phones.push("5551234567".to_string());
        let ab = score_pair(&a, &b, "k");
        let ba = score_pair(&b, &a, "k");
        assert_eq!(ab.composite_score, ba.composite_score);
        assert_eq!((ab.record_a.as_str(), ab.record_b.as_str()), ("m", "z"));
        assert_eq!(ab.component_scores.identity, 1.0);
    }

    #[test]
    fn test_rank_tie_break_on_overlap() {
        let base = score_pair(&record("a", "x"), &record("b", "x"), "k");
        let mut richer = base.clone();
        richer.record_a = "c".to_string();
        richer.overlap_fields = base.overlap_fields + 2;
        let mut list = vec![base.clone(), richer];
        rank(&mut list);
        assert_eq!(list[0].record_a, "c");
    }
}
