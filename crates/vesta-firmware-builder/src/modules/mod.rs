use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod core;
pub mod emulator;
pub mod flash;
pub mod secureworld;
pub mod testdrive;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(secureworld::SecureWorldModule),
        Box::new(flash::FlashModule),
        Box::new(testdrive::TestDriveModule),
        Box::new(emulator::EmulatorModule),
    ]
}
