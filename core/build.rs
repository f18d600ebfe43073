fn main() {
    uniffi::generate_scaffolding("src/divelog_ble.udl").unwrap();
    println!("cargo:rerun-if-changed=src/divelog_ble.udl");
}
