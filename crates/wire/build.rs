fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/envelope.proto");
    println!("cargo:rerun-if-changed=proto/payloads.proto");

    prost_build::Config::new().compile_protos(
        &["proto/envelope.proto", "proto/payloads.proto"],
        &["proto/"],
    )?;

    Ok(())
}
