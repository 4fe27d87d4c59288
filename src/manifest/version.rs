use std::cmp::Ordering;

/// Normalize a version string by trimming whitespace and a leading `v`.
fn normalize_version(version: &str) -> &str {
    version.trim().trim_start_matches(['v', 'V'])
}

#[derive(Debug, PartialEq, Eq)]
enum Part<'a> {
    Number(u64),
    Text(&'a str),
}

/// Split a version into dotted parts (e.g. "1.10.beta" -> [1, 10, "beta"]).
fn parse_version_parts(version: &str) -> Vec<Part<'_>> {
    normalize_version(version)
        .split(['.', '-', '+'])
        .filter(|part| !part.is_empty())
        .map(|part| match part.parse::<u64>() {
            Ok(number) => Part::Number(number),
            Err(_) => Part::Text(part),
        })
        .collect()
}

/// Split a qualifier into its text and trailing number ("rc10" -> ("rc", Some(10))).
fn split_qualifier(text: &str) -> (&str, Option<u64>) {
    let digits = text.len() - text.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (label, number) = text.split_at(text.len() - digits);
    (label, number.parse().ok())
}

fn compare_qualifiers(a: &str, b: &str) -> Ordering {
    let (label_a, number_a) = split_qualifier(a);
    let (label_b, number_b) = split_qualifier(b);
    label_a.cmp(label_b).then(number_a.cmp(&number_b))
}

fn compare_parts(a: Option<&Part<'_>>, b: Option<&Part<'_>>) -> Ordering {
    match (a, b) {
        (Some(Part::Number(a)), Some(Part::Number(b))) => a.cmp(b),
        (Some(Part::Text(a)), Some(Part::Text(b))) => compare_qualifiers(a, b),
        // A numbered release sorts above a textual qualifier in the same slot.
        (Some(Part::Number(_)), Some(Part::Text(_))) => Ordering::Greater,
        (Some(Part::Text(_)), Some(Part::Number(_))) => Ordering::Less,
        (Some(Part::Number(n)), None) => n.cmp(&0),
        (None, Some(Part::Number(n))) => 0.cmp(n),
        (Some(Part::Text(_)), None) => Ordering::Less,
        (None, Some(Part::Text(_))) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Compare two version/build identifiers. Missing numeric components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts_a = parse_version_parts(a);
    let parts_b = parse_version_parts(b);
    let max_len = parts_a.len().max(parts_b.len());

    for i in 0..max_len {
        let ordering = compare_parts(parts_a.get(i), parts_b.get(i));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}
