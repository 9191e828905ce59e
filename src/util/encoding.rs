use data_encoding::Encoding;
use data_encoding_macro::new_encoding;

/// Lower-case, file-name safe base32 without padding.
pub const FILE_SAFE_ENCODING: Encoding = new_encoding! {
    symbols: "abcdefghijklmnopqrstuvwxyz012345",
    padding: None,
    translate_from: "ABCDEFGHIJKLMNOPQRSTUVWXYZ",
    translate_to: "abcdefghijklmnopqrstuvwxyz",
};
