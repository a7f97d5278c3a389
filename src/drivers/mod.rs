pub mod ata;
pub mod keyboard;

pub fn init() {
    ata::init();
    keyboard::init();
}
