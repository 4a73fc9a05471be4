//! Build script for compile-time configuration injection.
//!
//! Set environment variables before building to configure the firmware:
//!
//!   TERMINAL_AES_KEY=0123456789abcdef \
//!   TERMINAL_UID_SIZE=10 \
//!   TERMINAL_GRANT_MS=5000 \
//!   TERMINAL_LORA_INTERVAL_S=900 \
//!   cargo build --release --features esp32s3
//!
//! Every variable is optional; unset values fall back to the defaults in
//! `src/config.rs`.

fn main() {
    // Re-run build script if these environment variables change
    println!("cargo::rerun-if-env-changed=TERMINAL_AES_KEY");
    println!("cargo::rerun-if-env-changed=TERMINAL_UID_SIZE");
    println!("cargo::rerun-if-env-changed=TERMINAL_GRANT_MS");
    println!("cargo::rerun-if-env-changed=TERMINAL_DENY_MS");
    println!("cargo::rerun-if-env-changed=TERMINAL_QR_TIMEOUT_MS");
    println!("cargo::rerun-if-env-changed=TERMINAL_RFID_TIMEOUT_MS");
    println!("cargo::rerun-if-env-changed=TERMINAL_LIGHT_THRESHOLD_EXP");
    println!("cargo::rerun-if-env-changed=TERMINAL_LIGHT_PERSIST");
    println!("cargo::rerun-if-env-changed=TERMINAL_LORA_INTERVAL_S");
    println!("cargo::rerun-if-env-changed=TERMINAL_STRICT_CIPHER");
    println!("cargo::rerun-if-env-changed=TERMINAL_STRICT_UID_SIZE");
    println!("cargo::rerun-if-env-changed=TERMINAL_EPOCH");
}
