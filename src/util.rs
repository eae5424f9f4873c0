use std::fmt::Display;

/// Joins items as English prose: `a`, `a and b`, `a, b, and c`.
pub fn format_list<I: IntoIterator<Item = T>, T: Display>(items: I) -> String {
    let items = items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>();
    match items.as_slice() {
        [] => String::new(),
        [only] => only.clone(),
        [first, second] => format!("{} and {}", first, second),
        [rest @ .., last] => format!("{}, and {}", rest.join(", "), last),
    }
}
