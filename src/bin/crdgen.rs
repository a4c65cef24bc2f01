use kube::CustomResourceExt;
use vm_export_controller::crd::VirtualMachineExport;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&VirtualMachineExport::crd())?);
    Ok(())
}
