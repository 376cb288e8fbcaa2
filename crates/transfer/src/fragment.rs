use crate::DEFAULT_FRAGMENT_SIZE;

/// Splits `data` into ordered chunks of at most `max_fragment_size` bytes.
///
/// Every chunk but the last is exactly `max_fragment_size` long. Empty input
/// yields no chunks. A size of 0 falls back to [`DEFAULT_FRAGMENT_SIZE`].
pub fn fragment(data: &[u8], max_fragment_size: usize) -> Vec<&[u8]> {
    let size = if max_fragment_size == 0 {
        DEFAULT_FRAGMENT_SIZE
    } else {
        max_fragment_size
    };
    data.chunks(size).collect()
}
