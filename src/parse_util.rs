//! Shared nom plumbing for the on-disk parsers.

use nom::bytes::streaming::take;

pub type PResult<'a, O> =
    std::result::Result<(&'a [u8], O), nom::Err<nom::error::VerboseError<&'a [u8]>>>;

/// Parser for a little-endian integer of `len` bytes, the width coming from
/// the superblock's offset-size or length-size. A reader must never assume
/// 8-byte pointers.
pub fn address<'a>(len: u8) -> impl Fn(&'a [u8]) -> PResult<'a, u64> {
    move |input| {
        let (input, bytes) = take(len as usize)(input)?;
        Ok((input, crate::codec::read_le(bytes)))
    }
}

/// Round `n` up to the next multiple of 8. Header messages and heap
/// payloads are 8-byte aligned on disk.
pub fn pad8(n: usize) -> usize {
    if n % 8 == 0 {
        n
    } else {
        n + (8 - (n % 8))
    }
}

/// NUL-terminated string out of a byte run; the terminator is not included.
pub fn cstr(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}

/// Build a nom failure tagged with a static context string, for checks the
/// combinators cannot express.
pub fn failure<'a>(
    input: &'a [u8],
    what: &'static str,
) -> nom::Err<nom::error::VerboseError<&'a [u8]>> {
    nom::Err::Failure(nom::error::VerboseError {
        errors: vec![(input, nom::error::VerboseErrorKind::Context(what))],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_widths() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(address(4)(&bytes).unwrap().1, 0x0403_0201);
        assert_eq!(address(8)(&bytes).unwrap().1, 0x0807_0605_0403_0201);
        let (rest, value) = address(2)(&bytes).unwrap();
        assert_eq!(value, 0x0201);
        assert_eq!(rest.len(), 6);
    }

    #[test]
    fn pad8_boundaries() {
        assert_eq!(pad8(0), 0);
        assert_eq!(pad8(1), 8);
        assert_eq!(pad8(8), 8);
        assert_eq!(pad8(9), 16);
    }

    #[test]
    fn cstr_stops_at_nul() {
        assert_eq!(cstr(b"name\0garbage"), "name");
        assert_eq!(cstr(b"bare"), "bare");
    }
}
