use ethers::prelude::abigen;

abigen!(
    IVault,
    r#"[
        function oracle() external view returns (address)
        function unitOfAccount() external view returns (address)
        function asset() external view returns (address)
    ]"#
);
