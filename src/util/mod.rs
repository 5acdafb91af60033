pub(crate) mod cryptoutil;
