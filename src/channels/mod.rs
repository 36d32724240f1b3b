pub mod instagram;
