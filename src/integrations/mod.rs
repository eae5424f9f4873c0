pub mod smartthings;
