//! Terminal front end for the console binary

mod console;

pub use console::Console;
