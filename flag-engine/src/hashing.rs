use std::fmt::Display;

/// Given a list of object ids, returns a number between 0 (inclusive) and 100 (exclusive).
///
/// The ids are joined with `,` (the whole list repeated `iterations` times), hashed with MD5,
/// and the full 128 bit digest is reduced modulo 9999. Given the same ids, it'll always return
/// the same float, so this is what every percentage based decision (segment splits, multivariate
/// bands) is bucketed with.
pub fn hashed_percentage_for_object_ids<T: Display>(object_ids: &[T]) -> f64 {
    hashed_percentage_with_iterations(object_ids, 1)
}

fn hashed_percentage_with_iterations<T: Display>(object_ids: &[T], iterations: usize) -> f64 {
    let ids: Vec<String> = object_ids.iter().map(ToString::to_string).collect();
    let to_hash = (0..iterations)
        .flat_map(|_| ids.iter().map(String::as_str))
        .collect::<Vec<&str>>()
        .join(",");

    let digest = md5::compute(to_hash.as_bytes());
    let hash_val = u128::from_be_bytes(digest.0);
    let value = (hash_val % 9999) as f64 / 9998.0 * 100.0;

    // We want a number in [0, 100), so in the unlikely case of exactly 100 we hash again
    // with more iterations, which yields a different digest.
    if value == 100.0 {
        return hashed_percentage_with_iterations(object_ids, iterations + 1);
    }

    value
}
