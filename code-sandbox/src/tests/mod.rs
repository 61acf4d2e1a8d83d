mod process;
mod utils;
mod vm;
