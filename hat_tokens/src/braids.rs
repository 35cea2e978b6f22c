use aliri_braid::braid;
use std::fmt;

macro_rules! redacted {
    ($ty:ty: $hidden:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(concat!("***", $hidden, "***"))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(concat!("***", $hidden, "***"))
            }
        }
    };
}

/// The identifier under which a long-lived credential is registered
///
/// For HAT owner credentials this is the HAT username, which also
/// determines the HAT's domain.
#[braid(serde)]
pub struct CredentialId;

/// A long-lived secret, such as a HAT owner's password
///
/// Neither the `Debug` nor the `Display` implementation will ever print the
/// underlying value. Use [`as_str()`][SecretRef::as_str()] at the point where
/// the secret must actually leave the process.
#[braid(debug = "owned", display = "owned")]
pub struct Secret;

redacted!(SecretRef: "SECRET");

/// The identifier of an application registered with a HAT
#[braid(serde)]
pub struct ApplicationId;
