use kube::CustomResourceExt;
use tripwire_sensor::crd::Sensor;

fn main() -> anyhow::Result<()> {
    // Generate Sensor CRD
    println!("---");
    println!("# Sensor CRD");
    println!("{}", serde_yaml::to_string(&Sensor::crd())?);
    Ok(())
}
