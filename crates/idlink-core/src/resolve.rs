//! Pure pieces of the identity-resolution algorithm: primary selection,
//! the novelty check, and response assembly. These operate on contact sets
//! already loaded from the store, so they can be tested without a database.

use crate::{ConsolidatedIdentity, Contact, ContactFragment, LinkPrecedence};
use std::collections::BTreeSet;

/// The set of distinct primary ids governing the matched contacts.
pub fn governing_primary_ids(matched: &[Contact]) -> BTreeSet<i64> {
    matched
        .iter()
        .map(Contact::governing_primary_id)
        .collect()
}

/// The surviving primary for a merge: the PRIMARY-tagged contact with the
/// earliest created_at, smallest id breaking ties.
pub fn winning_primary(related: &[Contact]) -> Option<&Contact> {
    related
        .iter()
        .filter(|contact| contact.is_primary())
        .min_by_key(|contact| (contact.created_at, contact.id))
}

/// Whether the cluster already carries the submitted fragment, matching
/// only on the fields that were actually supplied.
pub fn fragment_already_recorded(cluster: &[Contact], fragment: &ContactFragment) -> bool {
    cluster.iter().any(|contact| {
        match (fragment.email.as_deref(), fragment.phone_number.as_deref()) {
            (Some(email), Some(phone)) => {
                contact.email.as_deref() == Some(email)
                    && contact.phone_number.as_deref() == Some(phone)
            }
            (Some(email), None) => contact.email.as_deref() == Some(email),
            (None, Some(phone)) => contact.phone_number.as_deref() == Some(phone),
            (None, None) => false,
        }
    })
}

/// Assemble the consolidated view from the final cluster. The primary's own
/// identifiers lead each list; the rest follow in (created_at, id) order,
/// de-duplicated, with null/empty entries dropped.
pub fn consolidate(primary: &Contact, cluster: &[Contact]) -> ConsolidatedIdentity {
    let mut ordered: Vec<&Contact> = cluster.iter().collect();
    ordered.sort_by_key(|contact| (contact.created_at, contact.id));

    let mut emails = Vec::new();
    push_identifier(&mut emails, primary.email.as_deref());
    for contact in &ordered {
        push_identifier(&mut emails, contact.email.as_deref());
    }

    let mut phone_numbers = Vec::new();
    push_identifier(&mut phone_numbers, primary.phone_number.as_deref());
    for contact in &ordered {
        push_identifier(&mut phone_numbers, contact.phone_number.as_deref());
    }

    let secondary_contact_ids = ordered
        .iter()
        .filter(|contact| contact.link_precedence == LinkPrecedence::Secondary)
        .map(|contact| contact.id)
        .collect();

    ConsolidatedIdentity {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids,
    }
}

fn push_identifier(values: &mut Vec<String>, candidate: Option<&str>) {
    if let Some(value) = candidate {
        if !value.is_empty() && !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
    }
}
