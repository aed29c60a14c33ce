fn main() {
    // Set BUILD_DATE environment variable for compile-time access
    // Use system time to avoid adding chrono as a build dependency
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let (year, month, day) = days_to_ymd((secs / 86400) as i64);
    println!(
        "cargo:rustc-env=BUILD_DATE={:04}-{:02}-{:02}",
        year, month, day
    );

    // Compile the command channel protocol
    compile_protos();

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=protos/packet.proto");
}

/// Compile protobuf files using the pure-Rust protobuf-codegen parser
fn compile_protos() {
    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["protos"])
        .input("protos/packet.proto")
        .cargo_out_dir("protos")
        .run_from_script();
}

/// Convert days since Unix epoch to year-month-day
fn days_to_ymd(days: i64) -> (i32, u32, u32) {
    // Algorithm from http://howardhinnant.github.io/date_algorithms.html
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if m <= 2 { y + 1 } else { y };
    (year as i32, m, d)
}
