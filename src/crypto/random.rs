//! Secret key sampling from the operating system's entropy source.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use rand_core::OsRng;

use crate::crypto::TAG_EVEN;

/// Draw a uniformly random P-256 secret scalar.
pub(crate) fn secret_key() -> SecretKey {
    SecretKey::random(&mut OsRng)
}

/// Draw scalars until the public point has an even y-coordinate.
///
/// About half of all scalars qualify, so this takes two draws on average.
pub(crate) fn even_secret_key() -> SecretKey {
    loop {
        let secret = secret_key();
        if has_even_y(&secret) {
            return secret;
        }
    }
}

fn has_even_y(secret: &SecretKey) -> bool {
    secret.public_key().to_encoded_point(true).as_bytes()[0] == TAG_EVEN
}
