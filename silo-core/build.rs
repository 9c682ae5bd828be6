// Generates the Rust types and tonic client/server code for the tunnel's
// bidirectional Frame stream.
fn main() -> Result<(), anyhow::Error> {
	let proto_file = std::env::current_dir().unwrap().join("proto/tunnel.proto");
	let include_dir = std::env::current_dir().unwrap().join("proto/");

	tonic_build::configure()
		.build_server(true)
		.build_client(true)
		.compile_protos(
			&[proto_file.to_str().unwrap()],
			&[include_dir.to_str().unwrap()],
		)?;

	println!("cargo:rerun-if-changed={}", proto_file.to_str().unwrap());
	println!("cargo:rerun-if-changed={}", include_dir.to_str().unwrap());
	Ok(())
}
