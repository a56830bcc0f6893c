// build.rs for texconv-auto
//
// Handles the optional `bundled` feature: when active, copies the converter
// executable (pointed to by `TEXCONV_BUNDLE_BIN`) into Cargo's output
// directory and generates a tiny Rust source file that embeds the bytes with
// `include_bytes!`.

use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=TEXCONV_BUNDLE_BIN");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_BUNDLED");

    if std::env::var("CARGO_FEATURE_BUNDLED").is_err() {
        return;
    }

    // ── Locate the converter ──────────────────────────────────────────────
    let bin_src = match std::env::var("TEXCONV_BUNDLE_BIN") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => {
            panic!(
                "\n\
                 ┌─────────────────────────────────────────────────────────┐\n\
                 │  texconv-auto: `bundled` feature activated but          │\n\
                 │  `TEXCONV_BUNDLE_BIN` is not set.                       │\n\
                 │                                                         │\n\
                 │  Set it to the path of the converter executable:        │\n\
                 │                                                         │\n\
                 │  Windows: path\\to\\texconv.exe                           │\n\
                 │                                                         │\n\
                 │  Releases are published at:                             │\n\
                 │  https://github.com/microsoft/DirectXTex/releases       │\n\
                 └─────────────────────────────────────────────────────────┘\n"
            )
        }
    };

    if !bin_src.is_file() {
        panic!(
            "texconv-auto: TEXCONV_BUNDLE_BIN points to a file that does not exist: {}",
            bin_src.display()
        );
    }

    // ── Copy into OUT_DIR with a fixed, platform-neutral name ─────────────
    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR not set"));
    let bin_dest = out_dir.join("bundled_texconv_bin");

    std::fs::copy(&bin_src, &bin_dest).unwrap_or_else(|e| {
        panic!(
            "texconv-auto: failed to copy {} → {}: {}",
            bin_src.display(),
            bin_dest.display(),
            e
        )
    });

    // ── Generate bundled.rs ───────────────────────────────────────────────
    // `include_bytes!` needs a literal path at the expansion site, so the
    // invocation is written into a generated file and pulled in with
    // `include!()`.
    let bundled_rs = out_dir.join("bundled.rs");
    let code = r#"
/// The converter executable embedded at compile time.
///
/// Written to the managed path on first call to
/// [`crate::Provisioner::ensure_ready`].
pub static TEXCONV_BYTES: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/bundled_texconv_bin"));
"#;
    std::fs::write(&bundled_rs, code).unwrap_or_else(|e| {
        panic!(
            "texconv-auto: failed to write {}: {}",
            bundled_rs.display(),
            e
        )
    });

    println!("cargo:rerun-if-changed={}", bin_src.display());
}
