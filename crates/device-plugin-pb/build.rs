fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile_protos(&["proto/v1beta1.proto"], &["proto"])?;
    Ok(())
}
