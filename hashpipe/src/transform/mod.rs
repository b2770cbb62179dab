pub mod fluff;
