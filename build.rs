use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    let build_ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=OU_GRAD_BUILD_TIMESTAMP={build_ts}");

    if let Ok(tag) = std::env::var("OU_GRAD_RELEASE_TAG") {
        println!("cargo:rustc-env=OU_GRAD_RELEASE_TAG={tag}");
    }

    enforce_core_boundary();
}

fn enforce_core_boundary() {
    // Lightweight guard: the gradient core must stay free of tree parsing,
    // serialization formats and sampler machinery owned by host engines.
    let forbidden = [
        "quick_xml",
        "NewickParser",
        "parse_newick(",
        "load_tree_file(",
        "McmcChain",
    ];

    let mut violations = Vec::new();
    let src_root = PathBuf::from("src");
    let mut stack = vec![src_root];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let rel = path.to_string_lossy().to_string();
            let src = match fs::read_to_string(&path) {
                Ok(s) => s,
                Err(_) => continue,
            };
            for (line_no, line) in src.lines().enumerate() {
                for token in &forbidden {
                    if line.contains(token) {
                        violations.push(format!(
                            "{}:{} contains forbidden token '{}'",
                            rel,
                            line_no + 1,
                            token
                        ));
                    }
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\nerror: host-engine machinery detected in gradient core modules:");
        for v in violations {
            eprintln!("  - {v}");
        }
        panic!("boundary violations in gradient core modules");
    }
}
