//! Worker type listing command

pub fn list_workers() {
    let registry = frame_pipeline_workers::registry();

    println!("Built-in worker types:");
    for name in registry.type_names() {
        println!("  {name}");
    }

    println!("\nQualified names:");
    for name in registry.qualified_names() {
        println!("  {name}");
    }
}
